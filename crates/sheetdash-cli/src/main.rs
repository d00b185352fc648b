use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sheetdash_storage::DashboardStore;
use sheetdash_sync::{render_stats_report, ImportPipeline, SyncConfig};
use sheetdash_web::WebConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sheetdash")]
#[command(about = "Spreadsheet TSV importer and dashboard query API")]
struct Cli {
    /// SQLite store path (overrides SHEETDASH_DB_PATH).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the TSV export and rebuild the store.
    Sync {
        /// Source URL (overrides SHEETDASH_TSV_URL).
        #[arg(long)]
        url: Option<String>,
    },
    /// Serve the read-only JSON API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Drop and recreate the dashboard table without importing.
    Migrate,
    /// Print statistics for the current store.
    Stats,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { url: None }) {
        Commands::Sync { url } => {
            let mut config = SyncConfig::from_env();
            if let Some(db) = cli.db {
                config.db_path = db;
            }
            if let Some(url) = url {
                config.tsv_url = url;
            }
            let summary = ImportPipeline::new(config)?.run_once().await?;
            println!(
                "sync complete: run_id={} lines={} columns={} inserted={} skipped={} duration={}ms",
                summary.run_id,
                summary.fetched_lines,
                summary.header_columns,
                summary.inserted_rows,
                summary.skipped_rows,
                summary.duration().num_milliseconds()
            );
            println!("\n{}", render_stats_report(&summary.stats));
        }
        Commands::Serve { port } => {
            let mut config = WebConfig::from_env();
            if let Some(db) = cli.db {
                config.db_path = db;
            }
            if let Some(port) = port {
                config.port = port;
            }
            sheetdash_web::serve(config).await?;
        }
        Commands::Migrate => {
            let store = DashboardStore::new(resolve_db(cli.db));
            store.create_schema().await?;
            println!("schema recreated at {}", store.path().display());
        }
        Commands::Stats => {
            let store = DashboardStore::new(resolve_db(cli.db));
            let stats = store.summarize().await?;
            println!("{}", render_stats_report(&stats));
        }
    }

    Ok(())
}

fn resolve_db(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| SyncConfig::from_env().db_path)
}
