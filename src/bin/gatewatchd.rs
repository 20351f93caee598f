//! gatewatchd - multi-camera face identification daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by --config or GATEWATCH_CONFIG, then env overrides)
//! 2. Opens the SQLite event store, the identity tables and the snapshot directory
//! 3. Starts one connection worker per enabled camera and the shared pipeline pool
//! 4. Logs per-camera health, reloads identities, prunes old snapshots and
//!    restarts ended workers until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatewatch::detect::models_for;
use gatewatch::ingest::DefaultSourceFactory;
use gatewatch::{
    build_supervisor, Collaborators, FilesystemBlobStore, GatewatchConfig, SqliteEventStore,
    SqliteIdentitySource, StreamSupervisor,
};

const TICK: Duration = Duration::from_millis(500);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const RESTART_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a config file: TOML when named `*.toml`, JSON otherwise.
    #[arg(long, env = "GATEWATCH_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = GatewatchConfig::load_with_path(args.config.as_deref())?;

    let events = Arc::new(SqliteEventStore::open(&config.storage.db_path)?);
    let identities = Arc::new(SqliteIdentitySource::open(&config.storage.db_path)?);
    let blobs = Arc::new(FilesystemBlobStore::open(&config.storage.snapshot_dir)?);
    let models = models_for(&config.models)?;

    let supervisor = build_supervisor(
        &config,
        Collaborators {
            models,
            identities,
            events,
            blobs: blobs.clone(),
            sources: Arc::new(DefaultSourceFactory),
        },
    )?;

    log::info!(
        "gatewatchd {} writing to {} (snapshots under {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.db_path,
        blobs.root().display()
    );
    log::info!(
        "{} cameras configured, {} pipeline workers",
        config.cameras.len(),
        config.pipeline_workers
    );

    supervisor.start()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    prune_snapshots(&blobs, config.storage.snapshot_retention_days);

    let mut last_health_log = Instant::now();
    let mut last_identity_reload = Instant::now();
    let mut last_prune = Instant::now();
    let mut last_restart_check = Instant::now();

    loop {
        match rx.recv_timeout(TICK) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_health_log.elapsed() >= config.status_log_interval {
            log_health(&supervisor);
            last_health_log = Instant::now();
        }

        if let Some(interval) = config.identity_reload {
            if last_identity_reload.elapsed() >= interval {
                if let Err(e) = supervisor.reload_identity_cache() {
                    log::error!("identity reload failed; keeping previous cache: {:#}", e);
                }
                last_identity_reload = Instant::now();
            }
        }

        if last_restart_check.elapsed() >= RESTART_CHECK_INTERVAL {
            match supervisor.restart_failed() {
                Ok(restarted) if !restarted.is_empty() => {
                    log::warn!("restarted camera workers: {}", restarted.join(", "));
                }
                Ok(_) => {}
                Err(e) => log::error!("camera worker restart failed: {:#}", e),
            }
            last_restart_check = Instant::now();
        }

        if last_prune.elapsed() >= PRUNE_INTERVAL {
            prune_snapshots(&blobs, config.storage.snapshot_retention_days);
            last_prune = Instant::now();
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    supervisor.shutdown();
    log_health(&supervisor);
    Ok(())
}

fn log_health(supervisor: &StreamSupervisor) {
    let status = supervisor.system_status();
    for stream in &status.streams {
        log::info!(
            "camera {} state={} frames={} admitted={} dropped={} superseded={} failures={} last_error={}",
            stream.camera_id,
            stream.state,
            stream.frames_received,
            stream.frames_admitted,
            stream.frames_dropped,
            stream.frames_superseded,
            stream.consecutive_failures,
            stream.last_error.as_deref().unwrap_or("-")
        );
    }
    log::info!(
        "pipeline frames={} candidates={} suppressed={} events={} model_errors={} persistence_failures={} identities={}",
        status.pipeline.frames,
        status.pipeline.candidates,
        status.pipeline.suppressed,
        status.pipeline.committed,
        status.pipeline.model_errors,
        status.pipeline.persistence_failures,
        status.identities
    );
}

fn prune_snapshots(blobs: &FilesystemBlobStore, retention_days: u32) {
    match blobs.prune_older_than(retention_days) {
        Ok(0) => {}
        Ok(removed) => log::info!("pruned {} snapshot directories", removed),
        Err(e) => log::warn!("snapshot pruning failed: {:#}", e),
    }
}
