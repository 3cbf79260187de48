use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use evscrape_storage::read_column_values;
use evscrape_sync::{dedupe_collection, mark_reviewed, SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "evscrape-cli")]
#[command(about = "Scrape event listings and merge them into curated collections")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect every enabled source and merge into the collections.
    Sync,
    /// Collect every enabled source into a standalone CSV export.
    Scrape {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Remove duplicate rows from a collection, keeping one survivor per event.
    Dedupe { collection: String },
    /// Flag rows whose title appears in a CSV of reviewed titles.
    Mark {
        collection: String,
        titles: PathBuf,
        #[arg(long, default_value = "title")]
        title_column: String,
    },
    /// List the configured sources.
    Sources,
}

/// A bare name resolves inside the collections directory; anything that
/// looks like a path is used as given.
fn resolve_collection(config: &SyncConfig, collection: &str) -> PathBuf {
    if collection.ends_with(".csv") || collection.contains(std::path::MAIN_SEPARATOR) {
        PathBuf::from(collection)
    } else {
        config.collection_path(collection)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} sources={} fetched={} inserted={} duplicates_removed={} failed=[{}] reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.fetched_events,
                summary.inserted_rows,
                summary.duplicates_removed,
                summary.failed_names().join(", "),
                summary.reports_dir
            );
            if !summary.collection_failures.is_empty() {
                bail!("{} collection cycle(s) failed", summary.collection_failures.len());
            }
        }
        Commands::Scrape { out } => {
            let summary = pipeline.scrape_to_csv(out).await?;
            match &summary.path {
                Some(path) => println!("saved {} events to {}", summary.written, path.display()),
                None => println!("no events to save"),
            }
            for (source, count) in &summary.stats.by_source {
                println!("- {source}: {count}");
            }
            for (category, count) in summary.stats.categories_by_count() {
                println!("- {category}: {count}");
            }
            for failure in &summary.failures {
                eprintln!("source {} failed: {}", failure.source_id, failure.error);
            }
        }
        Commands::Dedupe { collection } => {
            let path = resolve_collection(pipeline.config(), &collection);
            let store = pipeline.open_collection(&path);
            let plan = dedupe_collection(&store, pipeline.engine()).await?;
            println!(
                "dedupe complete: collection={} groups={} removed={}",
                path.display(),
                plan.duplicate_groups.len(),
                plan.rows_to_delete.len()
            );
        }
        Commands::Mark {
            collection,
            titles,
            title_column,
        } => {
            let titles = read_column_values(&titles, &title_column)
                .await?
                .into_iter()
                .collect::<HashSet<_>>();
            let path = resolve_collection(pipeline.config(), &collection);
            let store = pipeline.open_collection(&path);
            let marked = mark_reviewed(&store, &titles, "title").await?;
            println!(
                "mark complete: collection={} titles={} marked={}",
                path.display(),
                titles.len(),
                marked
            );
        }
        Commands::Sources => {
            let registry = pipeline.load_source_registry().await?;
            for source in &registry.sources {
                println!(
                    "{}\t{}\tenabled={}\tmode={:?}\tmax_pages={}",
                    source.source_id, source.display_name, source.enabled, source.mode, source.max_pages
                );
            }
        }
    }

    Ok(())
}
