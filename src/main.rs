// =============================================================================
// Meridian Rebalancer — Main Entry Point
// =============================================================================
//
// Wires the settings store, history database, and periodic scheduler, then
// waits for Ctrl+C. The HTTP dashboard drives the same library surface and is
// deployed separately.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use meridian_rebalancer::executor::CycleLock;
use meridian_rebalancer::history::HistoryStore;
use meridian_rebalancer::scheduler::Scheduler;
use meridian_rebalancer::settings::{DataPaths, SettingsStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    let paths = DataPaths::from_env();
    std::fs::create_dir_all(&paths.log_dir)
        .with_context(|| format!("failed to create log directory {}", paths.log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "meridian.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Rebalancer — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Settings & master key ─────────────────────────────────────────
    let settings_store =
        Arc::new(SettingsStore::open(&paths).context("failed to open settings store")?);
    let settings = settings_store.current();
    info!(
        strategy = %settings.strategy,
        base_pair = %settings.base_pair,
        dry_run = settings.dry_run,
        periodic_hours = settings.periodic_hours,
        allocations = ?settings.allocations.keys().collect::<Vec<_>>(),
        "configuration active"
    );
    if settings.dry_run {
        info!("dry-run mode: cycles will simulate trades without placing orders");
    } else {
        warn!("LIVE mode: cycles will place real market orders");
    }

    // ── 3. History store ─────────────────────────────────────────────────
    let history = HistoryStore::open(&paths.db_file)
        .await
        .context("failed to open history store")?;
    if let Some(last) = history.latest().await? {
        info!(
            run_id = %last.run_id,
            status = %last.status,
            timestamp = %last.timestamp,
            "last recorded rebalance cycle"
        );
    }

    // ── 4. Scheduler ─────────────────────────────────────────────────────
    let lock = CycleLock::new();
    let scheduler = Scheduler::new(settings_store.clone(), history.clone(), lock.clone());
    scheduler.register_periodic();

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    scheduler.shutdown();
    if lock.is_busy() {
        info!("waiting for the in-flight rebalance cycle to complete");
        while lock.is_busy() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    info!("Meridian Rebalancer shut down complete.");
    Ok(())
}
