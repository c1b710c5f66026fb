use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use rillet::config::Config;
use rillet::feed::{export_to_file, read_opml_file, CancelFlag, HttpFetcher, Synchronizer};
use rillet::icons::IconCache;
use rillet::storage::{Database, DatabaseError};
use rillet::tree::{Aggregator, NodeKey};

#[derive(Parser, Debug)]
#[command(name = "rillet", about = "Headless RSS/Atom ingestion with grouped unread counts")]
struct Args {
    /// Config file (defaults to ~/.config/rillet/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Merge subscriptions from an OPML file
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,

    /// Write current subscriptions to an OPML file
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,

    /// Refresh all sources (or one group with --group)
    #[arg(long)]
    refresh: bool,

    /// Restrict --refresh to one group id
    #[arg(long, value_name = "ID", requires = "refresh")]
    group: Option<i64>,

    /// Remove soft-deleted entries older than the retention window
    #[arg(long)]
    purge: bool,

    /// Print the tree as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = Config::config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // User-only access on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(path = %config_dir.display(), error = %e, "Failed to restrict config directory");
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from '{}'", config_path.display()))?;

    let db_path = config.database_path(&config_dir);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another instance of rillet appears to be running. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let aggregator = Arc::new(
        Aggregator::load(db.clone())
            .await
            .context("Failed to load subscriptions")?,
    );

    if let Some(path) = &args.import {
        let doc = read_opml_file(path).await?;
        let report = aggregator
            .import_opml(&doc)
            .await
            .context("Failed to import subscriptions")?;
        println!(
            "Imported {} groups and {} sources ({} already subscribed, {} skipped)",
            report.groups_created, report.sources_created, report.existing, report.skipped
        );
    }

    if args.refresh {
        refresh(&config, &config_dir, Arc::clone(&aggregator), args.group).await?;
    }

    if args.purge {
        let removed = db
            .purge_deleted_entries(config.retention())
            .await
            .context("Failed to purge deleted entries")?;
        println!("Purged {} deleted entries", removed);
    }

    if let Some(path) = &args.export {
        let tree = aggregator
            .subscription_tree()
            .await
            .context("Failed to read subscriptions")?;
        export_to_file(&tree, path)?;
        println!("Exported {} sources to {}", tree.feed_count(), path.display());
    }

    if args.json {
        let snapshot = aggregator.snapshot();
        println!("{}", serde_json::to_string_pretty(&snapshot.outline())?);
    } else {
        print_tree(&aggregator);
    }

    Ok(())
}

async fn refresh(
    config: &Config,
    config_dir: &std::path::Path,
    aggregator: Arc<Aggregator>,
    group: Option<i64>,
) -> Result<()> {
    let fetcher = HttpFetcher::new(config.request_timeout(), &config.user_agent)
        .context("Failed to build HTTP client")?;
    let icons_dir = config.icons_dir(config_dir);
    let icons = IconCache::load(&icons_dir)
        .with_context(|| format!("Failed to open icon directory '{}'", icons_dir.display()))?;

    let (progress_tx, mut progress_rx) = mpsc::channel::<(usize, usize)>(32);
    let sync = Synchronizer::new(aggregator, Arc::new(fetcher), config.sync_options())
        .with_icons(Arc::new(icons))
        .with_progress(progress_tx);

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, finishing in-flight sources");
                cancel.cancel();
            }
        });
    }

    let printer = tokio::spawn(async move {
        while let Some((done, total)) = progress_rx.recv().await {
            eprint!("\rRefreshing {}/{}", done, total);
        }
        eprintln!();
    });

    let outcomes = match group {
        Some(id) => sync.refresh_group(id, &cancel).await,
        None => sync.refresh_all(&cancel).await,
    };
    drop(sync);
    let _ = printer.await;

    let inserted: usize = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok())
        .map(|r| r.inserted)
        .sum();
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    println!(
        "Refreshed {} sources: {} new entries, {} failed",
        outcomes.len(),
        inserted,
        failed
    );
    Ok(())
}

fn print_tree(aggregator: &Aggregator) {
    for node in aggregator.top_level() {
        println!("{:>6}  {}", node.unread, node.title);
        if let NodeKey::Group(id) = node.key {
            for child in aggregator.children(id) {
                println!("{:>6}    {}", child.unread, child.title);
            }
        }
    }
}
