use clap::Parser;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rag_watch::{
    cli::{Cli, OutputFormat},
    config::RagWatchConfig,
    content_hash, ChangeType, FileChange, FileFilter, HashStore, Watcher,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();

    let config = cli.resolve_config()?;
    let watch_path = cli.get_watch_path();

    if cli.status {
        return run_status(&cli, &config, &watch_path);
    }

    tracing::info!("Starting rag-watch on: {}", watch_path.display());
    run_watch(&cli, &config, &watch_path)
}

fn open_store(config: &RagWatchConfig) -> Result<Option<Arc<HashStore>>> {
    let Some(path) = &config.store.path else {
        return Ok(None);
    };
    let store = HashStore::open_with_timeout(path, config.store.open_timeout())
        .with_context(|| format!("Failed to open hash store {}", path.display()))?;
    Ok(Some(Arc::new(store)))
}

fn run_watch(cli: &Cli, config: &RagWatchConfig, watch_path: &Path) -> Result<()> {
    let store = open_store(config)?;

    let output = cli.output;
    let no_color = cli.no_color;
    let print_batch = move |batch: Vec<FileChange>| -> Result<()> {
        match output {
            OutputFormat::Json => println!("{}", serde_json::to_string(&batch)?),
            OutputFormat::Text => {
                for change in &batch {
                    print_text_change(change, no_color);
                }
            }
            OutputFormat::Compact => {
                for change in &batch {
                    print_compact_change(change);
                }
            }
        }
        Ok(())
    };

    let watcher = match &store {
        Some(store) => Watcher::with_store(watch_path, config.watcher.clone(), Arc::clone(store), print_batch)?,
        None => Watcher::new(watch_path, config.watcher.clone(), print_batch)?,
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    watcher.start()?;
    if output == OutputFormat::Text {
        eprintln!("Watching: {}", watcher.root().display());
        eprintln!("Press Ctrl+C to quit");
    }

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    watcher.stop();
    let stats = watcher.stats();
    tracing::info!(
        "Delivered {} changes in {} batches",
        stats.changes_delivered,
        stats.batches_delivered
    );

    if let Some(store) = &store {
        store.set_last_index_time(&config.store.collection, chrono::Utc::now())?;
    }

    Ok(())
}

/// Hashes the tree as it is now and compares it with the store.
fn run_status(cli: &Cli, config: &RagWatchConfig, watch_path: &Path) -> Result<()> {
    let store = open_store(config)?.context("--status needs a hash store")?;

    let root = watch_path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", watch_path.display()))?;
    let filter = FileFilter::new(&root, &config.watcher.exclude_patterns);
    let mut current: HashMap<PathBuf, String> = HashMap::new();
    for file in filter.scan(&root).files {
        match content_hash(&file) {
            Ok(hash) => {
                current.insert(file, hash);
            }
            Err(err) => tracing::warn!("Failed to hash {}: {}", file.display(), err),
        }
    }

    let changes = store.get_changed_files(&current)?;
    let last_index = store.get_last_index_time(&config.store.collection)?;

    if cli.output == OutputFormat::Json {
        let report = serde_json::json!({
            "root": root,
            "collection": config.store.collection,
            "last_index": last_index,
            "created": changes.created,
            "modified": changes.modified,
            "deleted": changes.deleted,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match last_index {
        Some(at) => println!("Last indexed: {}", at.to_rfc3339()),
        None => println!("Last indexed: never"),
    }
    if changes.is_empty() {
        println!("No changes ({} files tracked)", current.len());
        return Ok(());
    }

    let groups = [
        (ChangeType::Create, &changes.created),
        (ChangeType::Modify, &changes.modified),
        (ChangeType::Delete, &changes.deleted),
    ];
    for (kind, paths) in groups {
        for path in paths {
            if cli.output == OutputFormat::Compact {
                println!("{} {}", kind.short(), path.display());
            } else {
                println!("{} {}", paint(kind, kind.as_str(), cli.no_color), path.display());
            }
        }
    }

    Ok(())
}

fn paint(kind: ChangeType, label: &str, no_color: bool) -> String {
    if no_color {
        return label.to_string();
    }
    let color = match kind {
        ChangeType::Create => "\x1b[32m", // Green
        ChangeType::Modify => "\x1b[33m", // Yellow
        ChangeType::Delete => "\x1b[31m", // Red
        ChangeType::Rename => "\x1b[34m", // Blue
    };
    format!("{}{}\x1b[0m", color, label)
}

fn print_text_change(change: &FileChange, no_color: bool) {
    let time_str = chrono::DateTime::<chrono::Local>::from(change.timestamp)
        .format("%H:%M:%S")
        .to_string();
    let label = paint(change.change_type, change.change_type.as_str(), no_color);

    match change.old_path() {
        Some(old) => println!("[{}] {} {} -> {}", time_str, label, old.display(), change.path.display()),
        None => println!("[{}] {} {}", time_str, label, change.path.display()),
    }

    if let Some(hash) = &change.content_hash {
        println!("  sha256 {}", hash);
    }
}

fn print_compact_change(change: &FileChange) {
    match change.old_path() {
        Some(old) => println!("{} {} {}", change.change_type.short(), old.display(), change.path.display()),
        None => println!("{} {}", change.change_type.short(), change.path.display()),
    }
}
