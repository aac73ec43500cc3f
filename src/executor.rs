// =============================================================================
// Rebalance executor — one fetch → plan → execute → persist cycle
// =============================================================================
//
// At most one cycle runs per process: a try-acquire lock rejects duplicate
// triggers synchronously with a conflict error instead of queueing them.
//
// Within a plan, every SELL executes before any BUY so the quote currency is
// freed before it is spent. Per-trade failures are collected and do not stop
// the remaining trades. Whatever happens, exactly one history row is written
// per cycle; rows for failed cycles are flagged dry-run so they can never be
// mistaken for a real execution.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::binance::BinanceClient;
use crate::cmc::CmcClient;
use crate::engine::{self, PlanInputs};
use crate::error::{RebalancerError, Result};
use crate::history::HistoryStore;
use crate::pricing::{self, PriceMap};
use crate::quantity::format_for_api;
use crate::settings::AppSettings;
use crate::types::{
    PairRules, ProjectedBalance, ProposedTrade, RebalanceReport, RunStatus, TradeSide,
};

// =============================================================================
// Capability traits
// =============================================================================

/// What the executor needs from the exchange. [`BinanceClient`] is the
/// production implementation; tests substitute fakes.
#[async_trait]
pub trait ExchangeOps: Send + Sync {
    async fn balances(&self) -> Result<BTreeMap<String, Decimal>>;
    async fn all_prices(&self) -> Result<PriceMap>;
    async fn exchange_info(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<HashMap<String, PairRules>>;
    async fn create_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: &str,
        test: bool,
    ) -> Result<serde_json::Value>;
}

#[async_trait]
impl ExchangeOps for BinanceClient {
    async fn balances(&self) -> Result<BTreeMap<String, Decimal>> {
        BinanceClient::balances(self).await
    }

    async fn all_prices(&self) -> Result<PriceMap> {
        BinanceClient::all_prices(self).await
    }

    async fn exchange_info(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<HashMap<String, PairRules>> {
        BinanceClient::exchange_info(self, symbols).await
    }

    async fn create_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: &str,
        test: bool,
    ) -> Result<serde_json::Value> {
        BinanceClient::create_order(self, symbol, side, quantity, test).await
    }
}

/// What the executor needs from the market-ranking provider.
#[async_trait]
pub trait RankingOps: Send + Sync {
    async fn top_symbols(&self, limit: u32, convert: &str) -> Result<HashSet<String>>;
}

#[async_trait]
impl RankingOps for CmcClient {
    async fn top_symbols(&self, limit: u32, convert: &str) -> Result<HashSet<String>> {
        CmcClient::top_symbols(self, limit, convert).await
    }
}

// =============================================================================
// Single-flight lock
// =============================================================================

/// Non-reentrant cycle lock with try-acquire semantics. Clones share the same
/// underlying lock; one instance is created at startup and handed to every
/// executor and the scheduler.
#[derive(Clone, Default)]
pub struct CycleLock {
    inner: Arc<Mutex<()>>,
}

impl CycleLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire without waiting. A second caller while a cycle is in flight
    /// gets [`RebalancerError::Conflict`] immediately.
    fn try_acquire(&self) -> Result<OwnedMutexGuard<()>> {
        self.inner
            .clone()
            .try_lock_owned()
            .map_err(|_| RebalancerError::Conflict)
    }

    /// Whether a cycle currently holds the lock.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Drives one end-to-end rebalance cycle against injected collaborators.
/// Construct a fresh executor per trigger with a settings snapshot.
pub struct RebalanceExecutor {
    settings: AppSettings,
    exchange: Arc<dyn ExchangeOps>,
    ranking: Arc<dyn RankingOps>,
    history: HistoryStore,
    lock: CycleLock,
}

impl RebalanceExecutor {
    pub fn new(
        settings: AppSettings,
        exchange: Arc<dyn ExchangeOps>,
        ranking: Arc<dyn RankingOps>,
        history: HistoryStore,
        lock: CycleLock,
    ) -> Self {
        Self {
            settings,
            exchange,
            ranking,
            history,
            lock,
        }
    }

    /// Run one full cycle. `dry_run_override` forces the mode for this cycle
    /// only; otherwise the settings' dry-run flag applies.
    #[instrument(skip(self), name = "executor::run_cycle")]
    pub async fn run_cycle(&self, dry_run_override: Option<bool>) -> Result<RebalanceReport> {
        let _guard = self.lock.try_acquire()?;

        let run_id = Uuid::new_v4().to_string();
        let is_dry_run = dry_run_override.unwrap_or(self.settings.dry_run);
        info!(run_id = %run_id, dry_run = is_dry_run, "--- starting rebalance cycle ---");

        match self.fetch_plan_execute(&run_id, is_dry_run).await {
            Ok(report) => {
                self.history.insert(&report).await?;
                info!(
                    run_id = %run_id,
                    status = %report.status,
                    trades = report.trades.len(),
                    "--- finished rebalance cycle ---"
                );
                Ok(report)
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "rebalance cycle failed");
                let report = RebalanceReport {
                    run_id,
                    timestamp: Utc::now(),
                    status: RunStatus::Failed,
                    // Failed rows are always flagged dry-run so they can never
                    // be mistaken for a real execution.
                    is_dry_run: true,
                    message: e.to_string(),
                    trades: Vec::new(),
                    errors: vec![e.to_string()],
                    total_fees_usd: Decimal::ZERO,
                    projected_balances: BTreeMap::new(),
                    total_value_usd_before: None,
                    total_value_usd_after: None,
                };
                if let Err(persist_err) = self.history.insert(&report).await {
                    error!(error = %persist_err, "failed to persist FAILED history row");
                }
                Err(e)
            }
        }
    }

    async fn fetch_plan_execute(&self, run_id: &str, is_dry_run: bool) -> Result<RebalanceReport> {
        let settings = &self.settings;
        let base = settings.base_pair.to_uppercase();

        // ── Fetch ────────────────────────────────────────────────────────
        let balances = self.exchange.balances().await?;
        let prices = self.exchange.all_prices().await?;

        // Rules for every pair we could conceivably trade this cycle:
        // targeted assets plus everything already held.
        let pair_symbols: Vec<String> = settings
            .allocations
            .keys()
            .chain(balances.keys())
            .map(|a| a.to_uppercase())
            .filter(|a| *a != base)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|a| format!("{a}{base}"))
            .collect();
        let exchange_info = self.exchange.exchange_info(Some(&pair_symbols)).await?;
        let eligible = self
            .ranking
            .top_symbols(settings.max_cmc_rank, "USD")
            .await?;

        // ── Value before ─────────────────────────────────────────────────
        let usd_factor = pricing::base_to_usd(&prices, &base).unwrap_or(Decimal::ONE);
        let mut total_base_before = Decimal::ZERO;
        for (asset, quantity) in &balances {
            if let Some(rate) = pricing::asset_base_value(&prices, asset, &base) {
                total_base_before += *quantity * rate;
            }
        }
        let total_value_usd_before = Some(total_base_before * usd_factor);

        // ── Plan ─────────────────────────────────────────────────────────
        let targets: BTreeMap<String, Decimal> = settings
            .allocations
            .iter()
            .map(|(k, v)| {
                (
                    k.to_uppercase(),
                    Decimal::from_f64(*v).unwrap_or_default(),
                )
            })
            .collect();
        let plan = engine::plan(&PlanInputs {
            balances: &balances,
            prices: &prices,
            exchange_info: &exchange_info,
            target_allocations: &targets,
            eligible_symbols: &eligible,
            base_pair: &base,
            min_trade_value_usd: Decimal::from_f64(settings.min_trade_value_usd)
                .unwrap_or_default(),
            trade_fee_pct: Decimal::from_f64(settings.trade_fee_pct).unwrap_or_default(),
        });
        let total_value_usd_after = total_projected_usd(&plan.projected_balances);

        if plan.trades.is_empty() {
            info!(run_id, "portfolio is already balanced, no trades needed");
            return Ok(RebalanceReport {
                run_id: run_id.to_string(),
                timestamp: Utc::now(),
                status: RunStatus::Success,
                is_dry_run,
                message: "Portfolio is already balanced. No trades needed.".to_string(),
                trades: Vec::new(),
                errors: Vec::new(),
                total_fees_usd: Decimal::ZERO,
                projected_balances: plan.projected_balances,
                total_value_usd_before,
                total_value_usd_after,
            });
        }

        // ── Execute ──────────────────────────────────────────────────────
        let (executed, errors) = self.execute_plan(&plan.trades, is_dry_run).await;

        let status = if is_dry_run {
            RunStatus::DryRun
        } else if errors.is_empty() {
            RunStatus::Success
        } else if executed.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::PartialSuccess
        };
        let message = match status {
            RunStatus::DryRun => {
                format!("Dry run complete. {} trades simulated.", executed.len())
            }
            RunStatus::Success => {
                format!("Rebalance successful. {} trades executed.", executed.len())
            }
            RunStatus::PartialSuccess => {
                format!("Rebalance partially completed with {} errors.", errors.len())
            }
            RunStatus::Failed => {
                format!("Rebalance failed. All {} trades errored.", errors.len())
            }
        };

        Ok(RebalanceReport {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            status,
            is_dry_run,
            message,
            trades: executed,
            errors,
            total_fees_usd: plan.total_fees_usd,
            projected_balances: plan.projected_balances,
            total_value_usd_before,
            total_value_usd_after,
        })
    }

    /// Execute or simulate the plan, all SELLs before any BUY. Failures are
    /// recorded and the remaining trades continue.
    async fn execute_plan(
        &self,
        trades: &[ProposedTrade],
        is_dry_run: bool,
    ) -> (Vec<ProposedTrade>, Vec<String>) {
        let sells = trades.iter().filter(|t| t.side == TradeSide::Sell);
        let buys = trades.iter().filter(|t| t.side == TradeSide::Buy);

        let mut executed = Vec::new();
        let mut errors = Vec::new();

        for trade in sells.chain(buys) {
            let quantity = format_for_api(trade.quantity);

            if is_dry_run {
                info!(
                    symbol = %trade.symbol,
                    side = %trade.side,
                    %quantity,
                    "DRY RUN: order simulated"
                );
                executed.push(trade.clone());
                continue;
            }

            info!(
                symbol = %trade.symbol,
                side = %trade.side,
                %quantity,
                "EXECUTE: placing market order"
            );
            match self
                .exchange
                .create_order(&trade.symbol, trade.side, &quantity, false)
                .await
            {
                Ok(_) => executed.push(trade.clone()),
                Err(e) => {
                    let msg = format!("Failed to execute {} {}: {e}", trade.side, trade.symbol);
                    error!(symbol = %trade.symbol, error = %e, "trade execution failed");
                    errors.push(msg);
                }
            }
        }

        (executed, errors)
    }
}

impl std::fmt::Debug for RebalanceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceExecutor")
            .field("base_pair", &self.settings.base_pair)
            .field("dry_run", &self.settings.dry_run)
            .finish()
    }
}

/// Total projected portfolio value in USD; `None` as soon as any projected
/// entry has no resolvable USD value.
fn total_projected_usd(projected: &BTreeMap<String, ProjectedBalance>) -> Option<Decimal> {
    if projected.is_empty() {
        return None;
    }
    let mut total = Decimal::ZERO;
    for entry in projected.values() {
        total += entry.value_usd?;
    }
    Some(total)
}
