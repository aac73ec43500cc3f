// =============================================================================
// Periodic rebalance scheduler
// =============================================================================
//
// One job lives under a stable id; registering again replaces the running
// timer atomically. Every fire re-reads settings and builds fresh clients, so
// credential or allocation changes take effect without a restart. Cycles run
// in their own spawned task: shutdown stops future fires but never cancels a
// cycle mid-flight, and the single-flight lock keeps scheduled and manual
// triggers from overlapping.
//
// Dry-run cycles still execute on schedule so the simulation history stays a
// continuously exercised signal rather than a stale one.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::binance::BinanceClient;
use crate::cmc::CmcClient;
use crate::executor::{CycleLock, RebalanceExecutor};
use crate::history::HistoryStore;
use crate::settings::{SettingsStore, Strategy};
use crate::types::{RebalanceReport, RunStatus};

/// Stable id of the periodic rebalance job.
pub const PERIODIC_JOB_ID: &str = "periodic_rebalance";

/// Registry of timer jobs feeding the shared executor path.
pub struct Scheduler {
    store: Arc<SettingsStore>,
    history: HistoryStore,
    lock: CycleLock,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: Arc<SettingsStore>, history: HistoryStore, lock: CycleLock) -> Self {
        Self {
            store,
            history,
            lock,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register the periodic job, replacing any existing registration under
    /// the same id. The first fire happens one full period after this call.
    pub fn register_periodic(&self) {
        let settings = self.store.current();
        let period = Duration::from_secs(u64::from(settings.periodic_hours) * 3600);

        let store = Arc::clone(&self.store);
        let history = self.history.clone();
        let lock = self.lock.clone();

        let mut jobs = self.jobs.lock();
        if let Some(previous) = jobs.remove(PERIODIC_JOB_ID) {
            previous.abort();
            info!(job_id = PERIODIC_JOB_ID, "replacing existing scheduler job");
        }

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so the job
            // waits a full period before its first run.
            interval.tick().await;
            loop {
                interval.tick().await;
                let store = Arc::clone(&store);
                let history = history.clone();
                let lock = lock.clone();
                tokio::spawn(async move {
                    run_scheduled_cycle(store, history, lock).await;
                });
            }
        });
        jobs.insert(PERIODIC_JOB_ID.to_string(), handle);

        info!(
            job_id = PERIODIC_JOB_ID,
            hours = settings.periodic_hours,
            "scheduler job registered"
        );
    }

    /// Whether a job is currently registered under `job_id`.
    pub fn is_registered(&self, job_id: &str) -> bool {
        self.jobs.lock().contains_key(job_id)
    }

    /// Stop dispatching future fires. An in-flight cycle completes under its
    /// own lock.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock();
        for (job_id, handle) in jobs.drain() {
            handle.abort();
            info!(job_id = %job_id, "scheduler job stopped");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Body of one scheduled fire. Errors are logged, never propagated, so the
/// timer stays alive.
pub async fn run_scheduled_cycle(
    store: Arc<SettingsStore>,
    history: HistoryStore,
    lock: CycleLock,
) {
    info!("scheduler fired, starting periodic rebalance job");

    let settings = store.current();
    if settings.strategy != Strategy::Periodic {
        info!(
            strategy = %settings.strategy,
            "scheduler job skipped, strategy is not periodic"
        );
        return;
    }

    let api_key = store.decrypt(settings.binance.api_key_encrypted.as_deref());
    let api_secret = store.decrypt(settings.binance.secret_key_encrypted.as_deref());
    let cmc_key = store.decrypt(settings.cmc.api_key_encrypted.as_deref());

    if api_key.is_empty() || api_secret.is_empty() || cmc_key.is_empty() {
        // Recorded as a FAILED row, not a silent skip: the operator must see
        // repeated cycles failing after a key rotation.
        error!("scheduled cycle aborted, credentials are missing or could not be decrypted");
        record_failed_cycle(
            &history,
            "Scheduled rebalance aborted: API credentials are missing or could not be decrypted.",
        )
        .await;
        return;
    }

    let exchange = Arc::new(BinanceClient::new(api_key, api_secret));
    let ranking = Arc::new(CmcClient::new(cmc_key));
    let executor = RebalanceExecutor::new(settings, exchange, ranking, history.clone(), lock);

    match executor.run_cycle(None).await {
        Ok(report) => info!(
            run_id = %report.run_id,
            status = %report.status,
            "scheduled rebalance cycle finished"
        ),
        Err(e) => error!(error = %e, "scheduled rebalance cycle failed"),
    }

    info!("scheduler job finished");
}

async fn record_failed_cycle(history: &HistoryStore, message: &str) {
    let report = RebalanceReport {
        run_id: Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        status: RunStatus::Failed,
        is_dry_run: true,
        message: message.to_string(),
        trades: Vec::new(),
        errors: vec![message.to_string()],
        total_fees_usd: Decimal::ZERO,
        projected_balances: Default::default(),
        total_value_usd_before: None,
        total_value_usd_after: None,
    };
    if let Err(e) = history.insert(&report).await {
        error!(error = %e, "failed to persist FAILED history row from scheduler");
    }
}
