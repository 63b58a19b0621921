use std::path::{Path, PathBuf};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;

/// Noise excluded from every watch, in addition to caller patterns.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "*.pyc", "*.pyo", "__pycache__",
    "node_modules", ".git", ".svn",
    "*.swp", "*.swo", "*~",
    ".DS_Store", "Thumbs.db",
    "vendor", "target", "dist", "build",
];

const CODE_EXTENSIONS: &[&str] = &[
    "go", "js", "ts", "jsx", "tsx", "py", "java", "c", "cpp",
    "h", "hpp", "cs", "rb", "php", "swift", "kt", "rs", "scala",
    "sh", "bash", "zsh", "yml", "yaml", "json", "xml", "html",
    "css", "scss", "sql", "proto", "graphql", "vue", "svelte",
];

/// Whether the path has one of the tracked source extensions.
pub fn is_code_file<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            CODE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Directories and files found under a watch root.
#[derive(Debug, Default)]
pub struct TreeScan {
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

/// Exclude-pattern matcher for one watch root.
///
/// A pattern excludes a path when it matches the base name as a glob, or
/// when it occurs as a substring of the path relative to the root.
#[derive(Clone)]
pub struct FileFilter {
    root_path: PathBuf,
    globs: GlobSet,
    patterns: Vec<String>,
}

impl FileFilter {
    pub fn new<P: AsRef<Path>>(root_path: P, extra_patterns: &[String]) -> Self {
        let root_path = root_path.as_ref().to_path_buf();

        let mut patterns: Vec<String> = extra_patterns
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect();
        for default in DEFAULT_EXCLUDES {
            if !patterns.iter().any(|p| p == default) {
                patterns.push(default.to_string());
            }
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            match GlobBuilder::new(pattern).literal_separator(true).build() {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => {
                    tracing::warn!("Exclude pattern {:?} is not a valid glob, using substring match only: {}", pattern, err);
                }
            }
        }
        let globs = builder.build().unwrap_or_else(|err| {
            tracing::warn!("Failed to compile exclude globs: {}", err);
            GlobSet::empty()
        });

        Self { root_path, globs, patterns }
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_excluded<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();

        if let Some(name) = path.file_name() {
            if self.globs.is_match(Path::new(name)) {
                return true;
            }
        }

        let relative = path.strip_prefix(&self.root_path).unwrap_or(path);
        let relative = relative.to_string_lossy();
        if relative.is_empty() {
            return false;
        }
        self.patterns.iter().any(|p| relative.contains(p.as_str()))
    }

    /// Whether a file event on `path` is of interest.
    pub fn should_track<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        !self.is_excluded(path) && is_code_file(path)
    }

    /// Walks `dir`, pruning excluded directories without descending into
    /// them. Unreadable entries are logged and skipped.
    pub fn scan(&self, dir: &Path) -> TreeScan {
        let mut scan = TreeScan::default();
        let filter = self.clone();

        let walker = WalkBuilder::new(dir)
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| !filter.is_excluded(entry.path()))
            .build();

        for result in walker {
            match result {
                Ok(entry) => {
                    let Some(file_type) = entry.file_type() else {
                        continue;
                    };
                    if file_type.is_dir() {
                        scan.dirs.push(entry.into_path());
                    } else if file_type.is_file() && is_code_file(entry.path()) {
                        scan.files.push(entry.into_path());
                    }
                }
                Err(err) => {
                    tracing::warn!("Error walking directory: {}", err);
                }
            }
        }

        scan
    }
}
