//! export_events - dump recorded detection events as JSON

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;

use gatewatch::{EventStore, SqliteEventStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the gatewatch database.
    #[arg(long, env = "GATEWATCH_DB_PATH", default_value = "gatewatch.db")]
    db: String,
    /// Maximum number of events, newest first.
    #[arg(long, default_value_t = 100)]
    limit: usize,
    /// Export only the most recent event.
    #[arg(long)]
    latest: bool,
    /// Write to this file instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let store = SqliteEventStore::open(&args.db)?;

    let json = if args.latest {
        serde_json::to_string_pretty(&store.latest_event()?)?
    } else {
        serde_json::to_string_pretty(&store.recent_events(args.limit)?)?
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", json))
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("exported to {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json)?;
        }
    }
    Ok(())
}
