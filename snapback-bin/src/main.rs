use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use color_eyre::eyre;
use snapback_engine::memory::InMemoryInventory;
use snapback_lib::{fleet, run_fleet_cycle, BackupContext, RunOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Creates backup images for every instance carrying a `Backup` tag and
/// prunes old ones, keeping the tag's count of images per instance.
///
/// The engine evaluates a fleet snapshot (JSON) through the in-memory
/// backend; production transports implement the `CloudInventory` trait.
#[derive(Parser, Debug)]
#[command(name = "snapback", version, about)]
struct Cli {
    /// Fleet snapshot to evaluate (JSON)
    #[arg(short, long, value_name = "FILE")]
    fleet: PathBuf,

    /// Suppress all output for cron runs
    #[arg(long)]
    cron: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Bound on concurrently processed instances
    #[arg(long, default_value_t = 4)]
    parallelism: usize,

    /// Region(s) to back up (default: every region in the snapshot)
    regions: Vec<String>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    let cli = Cli::parse();

    let default_level = if cli.cron {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!(fleet = %cli.fleet.display(), "starting backup cycle");

    // Configuration problems are fatal before any instance is processed.
    let snapshot = match fleet::load_snapshot(&cli.fleet) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            eprintln!("snapback: {e}");
            std::process::exit(2);
        }
    };

    let backend = Arc::new(InMemoryInventory::from_snapshot(snapshot));
    let ctx = BackupContext::new(
        backend,
        RunOptions {
            regions: cli.regions,
            parallelism: cli.parallelism,
            ..Default::default()
        },
    );

    match run_fleet_cycle(&ctx, Utc::now()).await {
        Ok(report) => {
            if !cli.cron {
                println!("{report}");
                println!("Done.");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("snapback: {e}");
            std::process::exit(2);
        }
    }
}
