// =============================================================================
// End-to-end rebalance cycle tests with fake exchange and ranking clients
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use meridian_rebalancer::error::{RebalancerError, Result};
use meridian_rebalancer::executor::{CycleLock, ExchangeOps, RankingOps, RebalanceExecutor};
use meridian_rebalancer::history::HistoryStore;
use meridian_rebalancer::pricing::PriceMap;
use meridian_rebalancer::settings::AppSettings;
use meridian_rebalancer::types::{PairFilter, PairRules, RunStatus, TradeSide};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeExchange {
    balances: BTreeMap<String, Decimal>,
    prices: PriceMap,
    rules: HashMap<String, PairRules>,
    /// Pairs whose order placement should fail.
    failing_pairs: HashSet<String>,
    /// Artificial latency injected into the balance fetch.
    fetch_delay: Option<Duration>,
    /// When set, the balance fetch fails with this credential error code.
    credential_error: Option<i64>,
    orders: Mutex<Vec<(String, TradeSide, String)>>,
    requested_info_symbols: Mutex<Option<Vec<String>>>,
}

#[async_trait]
impl ExchangeOps for FakeExchange {
    async fn balances(&self) -> Result<BTreeMap<String, Decimal>> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = self.credential_error {
            return Err(RebalancerError::InvalidExchangeCredentials {
                code,
                message: "Invalid API-key, IP, or permissions for action.".to_string(),
            });
        }
        Ok(self.balances.clone())
    }

    async fn all_prices(&self) -> Result<PriceMap> {
        Ok(self.prices.clone())
    }

    async fn exchange_info(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<HashMap<String, PairRules>> {
        *self.requested_info_symbols.lock() = symbols.map(|s| s.to_vec());
        Ok(self.rules.clone())
    }

    async fn create_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: &str,
        _test: bool,
    ) -> Result<serde_json::Value> {
        if self.failing_pairs.contains(symbol) {
            return Err(RebalancerError::ExchangeApi {
                code: -2010,
                message: "Account has insufficient balance for requested action.".to_string(),
            });
        }
        self.orders
            .lock()
            .push((symbol.to_string(), side, quantity.to_string()));
        Ok(json!({"orderId": 1, "status": "FILLED"}))
    }
}

struct FakeRanking {
    symbols: HashSet<String>,
}

#[async_trait]
impl RankingOps for FakeRanking {
    async fn top_symbols(&self, _limit: u32, _convert: &str) -> Result<HashSet<String>> {
        Ok(self.symbols.clone())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn pair_rules(symbol: &str, step: &str, min_notional: &str) -> (String, PairRules) {
    (
        symbol.to_string(),
        PairRules {
            symbol: symbol.to_string(),
            filters: vec![
                PairFilter {
                    filter_type: "LOT_SIZE".to_string(),
                    step_size: Some(step.to_string()),
                    min_notional: None,
                },
                PairFilter {
                    filter_type: "MIN_NOTIONAL".to_string(),
                    step_size: None,
                    min_notional: Some(min_notional.to_string()),
                },
            ],
        },
    )
}

/// BTC 1.5 ($75k) / ETH 10 ($20k) / USDT 5k against a 60/30/10 target.
fn exchange() -> FakeExchange {
    FakeExchange {
        balances: BTreeMap::from([
            ("BTC".to_string(), dec!(1.5)),
            ("ETH".to_string(), dec!(10)),
            ("USDT".to_string(), dec!(5000)),
        ]),
        prices: PriceMap::from([
            ("BTCUSDT".to_string(), dec!(50000)),
            ("ETHUSDT".to_string(), dec!(2000)),
        ]),
        rules: HashMap::from([
            pair_rules("BTCUSDT", "0.00001", "10.0"),
            pair_rules("ETHUSDT", "0.0001", "10.0"),
        ]),
        ..FakeExchange::default()
    }
}

fn ranking() -> FakeRanking {
    FakeRanking {
        symbols: ["BTC", "ETH", "USDT"].iter().map(|s| s.to_string()).collect(),
    }
}

fn settings(dry_run: bool) -> AppSettings {
    let mut settings = AppSettings::default();
    settings.allocations = BTreeMap::from([
        ("BTC".to_string(), 60.0),
        ("ETH".to_string(), 30.0),
        ("USDT".to_string(), 10.0),
    ]);
    settings.dry_run = dry_run;
    settings
}

fn executor(
    exchange: FakeExchange,
    settings: AppSettings,
    history: HistoryStore,
    lock: CycleLock,
) -> (RebalanceExecutor, Arc<FakeExchange>) {
    let exchange = Arc::new(exchange);
    let executor = RebalanceExecutor::new(
        settings,
        exchange.clone(),
        Arc::new(ranking()),
        history,
        lock,
    );
    (executor, exchange)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_cycle_plans_without_placing_orders() {
    let history = HistoryStore::open_in_memory().await.unwrap();
    let (executor, exchange) =
        executor(exchange(), settings(true), history.clone(), CycleLock::new());

    let report = executor.run_cycle(None).await.unwrap();

    assert_eq!(report.status, RunStatus::DryRun);
    assert!(report.is_dry_run);
    assert_eq!(report.trades.len(), 2);
    assert!(report.errors.is_empty());
    assert!(exchange.orders.lock().is_empty());

    assert_eq!(report.total_value_usd_before, Some(dec!(100000)));
    assert_eq!(report.total_value_usd_after, Some(dec!(100000) - dec!(26.5)));
    assert_eq!(report.total_fees_usd, dec!(26.5));

    let row = history.latest().await.unwrap().unwrap();
    assert_eq!(row.run_id, report.run_id);
    assert_eq!(row.status, RunStatus::DryRun);
    assert!(row.is_dry_run);
    assert_eq!(row.trades.len(), 2);
    assert_eq!(row.total_value_usd_before, Some(100000.0));
}

#[tokio::test]
async fn live_cycle_executes_sells_before_buys() {
    let history = HistoryStore::open_in_memory().await.unwrap();
    let (executor, exchange) =
        executor(exchange(), settings(false), history.clone(), CycleLock::new());

    let report = executor.run_cycle(None).await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert!(!report.is_dry_run);

    let orders = exchange.orders.lock().clone();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].0, "BTCUSDT");
    assert_eq!(orders[0].1, TradeSide::Sell);
    assert_eq!(orders[0].2, "0.36");
    assert_eq!(orders[1].0, "ETHUSDT");
    assert_eq!(orders[1].1, TradeSide::Buy);
    assert_eq!(orders[1].2, "4.25");

    let row = history.latest().await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Success);
    assert!(!row.is_dry_run);
}

#[tokio::test]
async fn dry_run_override_forces_simulation_for_one_cycle() {
    let history = HistoryStore::open_in_memory().await.unwrap();
    let (executor, exchange) =
        executor(exchange(), settings(false), history.clone(), CycleLock::new());

    let report = executor.run_cycle(Some(true)).await.unwrap();

    assert_eq!(report.status, RunStatus::DryRun);
    assert!(exchange.orders.lock().is_empty());
}

#[tokio::test]
async fn failed_trade_yields_partial_success_and_continues() {
    let history = HistoryStore::open_in_memory().await.unwrap();
    let mut fake = exchange();
    fake.failing_pairs.insert("BTCUSDT".to_string());
    let (executor, exchange) =
        executor(fake, settings(false), history.clone(), CycleLock::new());

    let report = executor.run_cycle(None).await.unwrap();

    assert_eq!(report.status, RunStatus::PartialSuccess);
    assert_eq!(report.trades.len(), 1);
    assert_eq!(report.trades[0].symbol, "ETHUSDT");
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("SELL BTCUSDT"));

    // The BTC failure must not have stopped the ETH buy.
    let orders = exchange.orders.lock().clone();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].0, "ETHUSDT");

    let row = history.latest().await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::PartialSuccess);
    assert_eq!(row.errors.len(), 1);
}

#[tokio::test]
async fn all_trades_failing_yields_failed_status() {
    let history = HistoryStore::open_in_memory().await.unwrap();
    let mut fake = exchange();
    fake.failing_pairs.insert("BTCUSDT".to_string());
    fake.failing_pairs.insert("ETHUSDT".to_string());
    let (executor, _) = executor(fake, settings(false), history.clone(), CycleLock::new());

    let report = executor.run_cycle(None).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.trades.is_empty());
    assert_eq!(report.errors.len(), 2);

    let row = history.latest().await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Failed);
}

#[tokio::test]
async fn balanced_portfolio_succeeds_with_no_trades() {
    let history = HistoryStore::open_in_memory().await.unwrap();
    let mut fake = exchange();
    // Exactly on target: BTC 60%, ETH 30%, USDT float ignored by the engine.
    fake.balances = BTreeMap::from([
        ("BTC".to_string(), dec!(1.2)),   // $60k
        ("ETH".to_string(), dec!(15)),    // $30k
        ("USDT".to_string(), dec!(10000)),
    ]);
    let mut cfg = settings(false);
    cfg.allocations = BTreeMap::from([
        ("BTC".to_string(), 66.67),
        ("ETH".to_string(), 33.33),
        ("USDT".to_string(), 0.0),
    ]);
    // The residual $3 delta per asset sits below the $10 trade minimum.
    let (executor, exchange) = executor(fake, cfg, history.clone(), CycleLock::new());

    let report = executor.run_cycle(None).await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert!(report.trades.is_empty());
    assert!(report.message.contains("already balanced"));
    assert!(exchange.orders.lock().is_empty());

    let row = history.latest().await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Success);
    assert!(row.trades.is_empty());
}

#[tokio::test]
async fn concurrent_trigger_is_rejected_with_conflict() {
    let history = HistoryStore::open_in_memory().await.unwrap();
    let lock = CycleLock::new();

    let mut slow = exchange();
    slow.fetch_delay = Some(Duration::from_millis(300));
    let (first, _) = executor(slow, settings(true), history.clone(), lock.clone());
    let (second, _) = executor(exchange(), settings(true), history.clone(), lock.clone());

    let first = Arc::new(first);
    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.run_cycle(None).await })
    };
    // Let the first cycle acquire the lock and suspend inside the fetch.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let conflict = second.run_cycle(None).await;
    assert!(matches!(conflict, Err(RebalancerError::Conflict)));

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::DryRun);

    // Exactly one row: the rejected trigger must not have persisted anything.
    let rows = history.list(None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].run_id, report.run_id);
}

#[tokio::test]
async fn fetch_failure_persists_a_failed_dry_row_and_propagates() {
    let history = HistoryStore::open_in_memory().await.unwrap();
    let mut fake = exchange();
    fake.credential_error = Some(-2015);
    let (executor, _) = executor(fake, settings(false), history.clone(), CycleLock::new());

    let err = executor.run_cycle(None).await.unwrap_err();
    assert!(err.is_invalid_credentials());

    let row = history.latest().await.unwrap().unwrap();
    assert_eq!(row.status, RunStatus::Failed);
    // Failed rows are always flagged dry-run, even on live-mode cycles.
    assert!(row.is_dry_run);
    assert!(row.summary_message.contains("credentials"));
}

#[tokio::test]
async fn exchange_rules_are_requested_for_held_and_targeted_pairs() {
    let history = HistoryStore::open_in_memory().await.unwrap();
    let mut fake = exchange();
    fake.balances.insert("DOGE".to_string(), dec!(1000));
    let (executor, exchange) =
        executor(fake, settings(true), history.clone(), CycleLock::new());

    executor.run_cycle(None).await.unwrap();

    let requested = exchange.requested_info_symbols.lock().clone().unwrap();
    assert!(requested.contains(&"BTCUSDT".to_string()));
    assert!(requested.contains(&"ETHUSDT".to_string()));
    assert!(requested.contains(&"DOGEUSDT".to_string()));
    // The base pair is never paired with itself.
    assert!(!requested.contains(&"USDTUSDT".to_string()));
}
