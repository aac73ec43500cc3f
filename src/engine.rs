// =============================================================================
// Rebalance planning engine
// =============================================================================
//
// Pure calculation, no I/O and no state: given balances, prices, exchange
// rules, targets, and the eligibility set, produce the minimal market-order
// plan plus a simulation of its effect on balances.
//
// All sizing math runs in exact decimals. The delta for an asset is computed
// as `target% * total - current_value` rather than through the percentage
// difference, which keeps round targets exact (60% of 95 000 is 57 000, not
// 56 999.999...).
//
// Eligibility gates trading, never valuation: an asset outside the ranking
// set keeps contributing its value to the portfolio total but is neither
// bought nor sold this cycle. The base pair is always retained.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::pricing::{self, PriceMap};
use crate::quantity::adjust_to_step;
use crate::types::{PairRules, ProjectedBalance, ProposedTrade, RebalancePlan, TradeSide};

/// Everything the planner needs for one cycle.
#[derive(Debug)]
pub struct PlanInputs<'a> {
    pub balances: &'a BTreeMap<String, Decimal>,
    pub prices: &'a PriceMap,
    pub exchange_info: &'a HashMap<String, PairRules>,
    pub target_allocations: &'a BTreeMap<String, Decimal>,
    pub eligible_symbols: &'a HashSet<String>,
    pub base_pair: &'a str,
    pub min_trade_value_usd: Decimal,
    pub trade_fee_pct: Decimal,
}

/// Compute the trade plan for one rebalance cycle.
///
/// Deterministic: identical inputs always produce the identical trade list,
/// ordered by asset symbol.
pub fn plan(inputs: &PlanInputs<'_>) -> RebalancePlan {
    let base = inputs.base_pair.to_uppercase();
    let hundred = Decimal::ONE_HUNDRED;

    // Symbols are case-insensitive at entry; canonical uppercase from here on.
    let balances: BTreeMap<String, Decimal> = inputs
        .balances
        .iter()
        .map(|(k, v)| (k.to_uppercase(), *v))
        .collect();
    let targets: BTreeMap<String, Decimal> = inputs
        .target_allocations
        .iter()
        .map(|(k, v)| (k.to_uppercase(), *v))
        .collect();

    // ── 1. Assets under management: held or targeted, base pair excluded ──
    let mut assets: BTreeSet<String> = BTreeSet::new();
    for symbol in balances.keys().chain(targets.keys()) {
        if *symbol != base {
            assets.insert(symbol.clone());
        }
    }

    // ── 2. Valuation in base units; assets without a price drop out ──────
    let mut value_base: BTreeMap<String, Decimal> = BTreeMap::new();
    let mut total_managed_value = Decimal::ZERO;
    for asset in &assets {
        let quantity = balances.get(asset).copied().unwrap_or_default();
        match pricing::asset_base_value(inputs.prices, asset, &base) {
            Some(rate) => {
                let value = quantity * rate;
                value_base.insert(asset.clone(), value);
                total_managed_value += value;
            }
            None => {
                if quantity > Decimal::ZERO {
                    warn!(%asset, "no price against the base pair, excluding from plan");
                }
            }
        }
    }

    let base_quantity = balances.get(&base).copied().unwrap_or_default();
    debug!(
        total_managed_value = %total_managed_value,
        total_portfolio_value = %(total_managed_value + base_quantity),
        assets = value_base.len(),
        "portfolio valued"
    );

    if total_managed_value.is_zero() {
        warn!("portfolio holds no valued assets, nothing to rebalance");
        return RebalancePlan {
            trades: Vec::new(),
            total_fees_usd: Decimal::ZERO,
            projected_balances: project(inputs, &base, &[]),
        };
    }

    // USD is only needed for thresholds and reporting; when the base pair has
    // no USD rate those fall back to base units.
    let base_usd_rate = pricing::base_to_usd(inputs.prices, &base);
    let usd_factor = base_usd_rate.unwrap_or(Decimal::ONE);

    // ── 3. Per-asset deltas and trade generation ─────────────────────────
    let mut trades: Vec<ProposedTrade> = Vec::new();
    for (asset, &current_value) in &value_base {
        let current_pct = current_value / total_managed_value * hundred;
        let target_pct = targets.get(asset).copied().unwrap_or_default();
        let delta_pct = target_pct - current_pct;
        let delta_base = target_pct * total_managed_value / hundred - current_value;

        if delta_base.abs() * usd_factor < inputs.min_trade_value_usd {
            debug!(%asset, delta_base = %delta_base, "delta below minimum trade value");
            continue;
        }

        if !inputs.eligible_symbols.contains(asset) {
            debug!(%asset, "outside the ranking eligibility set, holding position");
            continue;
        }

        let pair = format!("{asset}{base}");
        let Some(price) = inputs.prices.get(&pair).copied().filter(|p| !p.is_zero()) else {
            warn!(%pair, "no direct pair price, skipping asset");
            continue;
        };
        let Some(rules) = inputs.exchange_info.get(&pair) else {
            warn!(%pair, "no exchange rules, skipping asset");
            continue;
        };
        let Some(step_size) = rules.step_size() else {
            warn!(%pair, "no LOT_SIZE filter, skipping asset");
            continue;
        };
        let Some(min_notional) = rules.min_notional() else {
            warn!(%pair, "no MIN_NOTIONAL or NOTIONAL filter, skipping asset");
            continue;
        };

        let raw_quantity = delta_base.abs() / price;
        let quantity = match adjust_to_step(raw_quantity, step_size) {
            Ok(q) => q,
            Err(e) => {
                warn!(%pair, error = %e, "unusable step size, skipping asset");
                continue;
            }
        };
        let final_value_base = quantity * price;

        if quantity <= Decimal::ZERO || final_value_base < min_notional {
            debug!(
                %pair,
                quantity = %quantity,
                value = %final_value_base,
                min_notional = %min_notional,
                "trade discarded below lot or notional minimum"
            );
            continue;
        }

        let side = if delta_base > Decimal::ZERO {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        };
        let estimated_value_usd = final_value_base * usd_factor;
        let fee_cost_usd = estimated_value_usd * inputs.trade_fee_pct / hundred;
        let reason = format!(
            "Target: {target_pct:.2}%, Current: {current_pct:.2}%, Delta: {delta_pct:.2}%"
        );

        info!(
            %pair,
            %side,
            quantity = %quantity,
            value_base = %final_value_base,
            "proposing trade"
        );

        trades.push(ProposedTrade {
            symbol: pair,
            asset: asset.clone(),
            side,
            quantity,
            estimated_value_base: final_value_base,
            estimated_value_usd,
            fee_cost_usd,
            reason,
        });
    }

    let total_fees_usd: Decimal = trades.iter().map(|t| t.fee_cost_usd).sum();
    let projected_balances = project(inputs, &base, &trades);

    RebalancePlan {
        trades,
        total_fees_usd,
        projected_balances,
    }
}

/// Simulate the plan's effect on balances: trades apply in emission order,
/// with the fee absorbed on the received side of each fill.
fn project(
    inputs: &PlanInputs<'_>,
    base: &str,
    trades: &[ProposedTrade],
) -> BTreeMap<String, ProjectedBalance> {
    let fee_keep = Decimal::ONE - inputs.trade_fee_pct / Decimal::ONE_HUNDRED;

    let mut quantities: BTreeMap<String, Decimal> = inputs
        .balances
        .iter()
        .map(|(k, v)| (k.to_uppercase(), *v))
        .collect();
    quantities.entry(base.to_string()).or_insert(Decimal::ZERO);

    for trade in trades {
        match trade.side {
            TradeSide::Buy => {
                *quantities.entry(trade.asset.clone()).or_default() += trade.quantity * fee_keep;
                *quantities.entry(base.to_string()).or_default() -= trade.estimated_value_base;
            }
            TradeSide::Sell => {
                *quantities.entry(trade.asset.clone()).or_default() -= trade.quantity;
                *quantities.entry(base.to_string()).or_default() +=
                    trade.estimated_value_base * fee_keep;
            }
        }
    }

    let mut projected = BTreeMap::new();
    for (asset, quantity) in quantities {
        let Some(rate) = pricing::asset_base_value(inputs.prices, &asset, base) else {
            debug!(%asset, "no base rate, omitting from projection");
            continue;
        };
        let value_usd = pricing::asset_usd_value(inputs.prices, &asset, base)
            .map(|usd_rate| quantity * usd_rate);
        projected.insert(
            asset,
            ProjectedBalance {
                quantity,
                value_in_base: quantity * rate,
                value_usd,
            },
        );
    }
    projected
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PairFilter;
    use rust_decimal_macros::dec;

    struct Fixture {
        balances: BTreeMap<String, Decimal>,
        prices: PriceMap,
        exchange_info: HashMap<String, PairRules>,
        targets: BTreeMap<String, Decimal>,
        eligible: HashSet<String>,
        min_trade_value_usd: Decimal,
        trade_fee_pct: Decimal,
    }

    impl Fixture {
        fn inputs(&self) -> PlanInputs<'_> {
            PlanInputs {
                balances: &self.balances,
                prices: &self.prices,
                exchange_info: &self.exchange_info,
                target_allocations: &self.targets,
                eligible_symbols: &self.eligible,
                base_pair: "USDT",
                min_trade_value_usd: self.min_trade_value_usd,
                trade_fee_pct: self.trade_fee_pct,
            }
        }
    }

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

    /// BTC 1.5 ($75k), ETH 10 ($20k), USDT 5k, plus unpriced XRP dust.
    fn fixture() -> Fixture {
        Fixture {
            balances: BTreeMap::from([
                ("BTC".to_string(), dec!(1.5)),
                ("ETH".to_string(), dec!(10)),
                ("USDT".to_string(), dec!(5000)),
                ("XRP".to_string(), dec!(10000)),
            ]),
            prices: PriceMap::from([
                ("BTCUSDT".to_string(), dec!(50000)),
                ("ETHUSDT".to_string(), dec!(2000)),
                ("BNBUSDT".to_string(), dec!(300)),
            ]),
            exchange_info: HashMap::from([
                pair_rules("BTCUSDT", "0.00001", "10.0"),
                pair_rules("ETHUSDT", "0.0001", "10.0"),
                pair_rules("BNBUSDT", "0.01", "10.0"),
            ]),
            targets: BTreeMap::from([
                ("BTC".to_string(), dec!(60)),
                ("ETH".to_string(), dec!(30)),
                ("USDT".to_string(), dec!(10)),
            ]),
            eligible: ["BTC", "ETH", "USDT", "BNB", "XRP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_trade_value_usd: dec!(10),
            trade_fee_pct: dec!(0.1),
        }
    }

    #[test]
    fn overweight_btc_underweight_eth() {
        let fx = fixture();
        let result = plan(&fx.inputs());

        assert_eq!(result.trades.len(), 2);
        let sell = result
            .trades
            .iter()
            .find(|t| t.side == TradeSide::Sell)
            .unwrap();
        let buy = result
            .trades
            .iter()
            .find(|t| t.side == TradeSide::Buy)
            .unwrap();

        // Managed value is $95k: sell $18k of BTC, buy $8.5k of ETH.
        assert_eq!(sell.asset, "BTC");
        assert_eq!(sell.symbol, "BTCUSDT");
        assert_eq!(sell.quantity, dec!(0.36));
        assert_eq!(sell.estimated_value_base, dec!(18000));
        assert_eq!(sell.estimated_value_usd, dec!(18000));
        assert_eq!(sell.fee_cost_usd, dec!(18));

        assert_eq!(buy.asset, "ETH");
        assert_eq!(buy.quantity, dec!(4.25));
        assert_eq!(buy.estimated_value_base, dec!(8500));
        assert_eq!(buy.fee_cost_usd, dec!(8.5));

        assert_eq!(result.total_fees_usd, dec!(26.5));
        assert!(sell.reason.contains("Target: 60.00%"));
        assert!(sell.reason.contains("Delta: -18.95%"));
    }

    #[test]
    fn projection_conserves_value_minus_fees() {
        let fx = fixture();
        let result = plan(&fx.inputs());

        // BTC 1.14 → 57 000; ETH 14.24575 → 28 491.5; USDT 14 482.
        let projected_total: Decimal = result
            .projected_balances
            .values()
            .map(|p| p.value_in_base)
            .sum();
        assert_eq!(projected_total, dec!(100000) - dec!(26.5));

        let btc = &result.projected_balances["BTC"];
        assert_eq!(btc.quantity, dec!(1.14));
        let eth = &result.projected_balances["ETH"];
        assert_eq!(eth.quantity, dec!(14.24575));
        let usdt = &result.projected_balances["USDT"];
        assert_eq!(usdt.quantity, dec!(14482.00));
    }

    #[test]
    fn projection_omits_unpriced_assets() {
        let fx = fixture();
        let result = plan(&fx.inputs());
        assert!(!result.projected_balances.contains_key("XRP"));
        assert!(result.projected_balances["USDT"].value_usd.is_some());
    }

    #[test]
    fn deltas_below_minimum_trade_value_are_dropped() {
        let mut fx = fixture();
        fx.targets = BTreeMap::from([
            ("BTC".to_string(), dec!(78.9)),
            ("ETH".to_string(), dec!(21.1)),
            ("USDT".to_string(), dec!(0)),
        ]);
        fx.min_trade_value_usd = dec!(100);

        let result = plan(&fx.inputs());
        assert!(result.trades.is_empty());
        assert_eq!(result.total_fees_usd, Decimal::ZERO);
    }

    #[test]
    fn trades_below_min_notional_are_dropped() {
        let mut fx = fixture();
        fx.exchange_info
            .insert("BTCUSDT".to_string(), pair_rules("BTCUSDT", "0.00001", "20000.0").1);

        let result = plan(&fx.inputs());
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].asset, "ETH");
        assert_eq!(result.trades[0].side, TradeSide::Buy);
    }

    #[test]
    fn ineligible_assets_are_valued_but_never_traded() {
        let mut fx = fixture();
        fx.eligible = ["ETH", "USDT"].iter().map(|s| s.to_string()).collect();

        let result = plan(&fx.inputs());
        // BTC keeps its $75k weight in the total, so ETH is still a buy, but
        // no BTC order may be emitted in either direction.
        assert_eq!(result.trades.len(), 1);
        let buy = &result.trades[0];
        assert_eq!(buy.asset, "ETH");
        assert_eq!(buy.side, TradeSide::Buy);
        assert_eq!(buy.estimated_value_base, dec!(8500));
    }

    #[test]
    fn new_asset_is_bought_from_scratch() {
        let mut fx = fixture();
        fx.balances.insert("USDT".to_string(), dec!(15000));
        fx.targets = BTreeMap::from([
            ("BTC".to_string(), dec!(70)),
            ("ETH".to_string(), dec!(20)),
            ("USDT".to_string(), dec!(0)),
            ("BNB".to_string(), dec!(10)),
        ]);

        let result = plan(&fx.inputs());
        let bnb = result.trades.iter().find(|t| t.asset == "BNB").unwrap();
        assert_eq!(bnb.side, TradeSide::Buy);
        // 10% of the $95k managed value, floored to the 0.01 BNB step.
        assert_eq!(bnb.quantity, dec!(31.66));
        assert_eq!(bnb.estimated_value_base, dec!(9498.00));
    }

    #[test]
    fn base_pair_is_never_traded() {
        let fx = fixture();
        let result = plan(&fx.inputs());
        assert!(result.trades.iter().all(|t| t.asset != "USDT"));
    }

    #[test]
    fn every_trade_is_an_exact_step_multiple_above_notional() {
        let fx = fixture();
        let result = plan(&fx.inputs());
        for trade in &result.trades {
            let rules = &fx.exchange_info[&trade.symbol];
            let step: Decimal = rules.step_size().unwrap().parse().unwrap();
            assert_eq!(trade.quantity % step, Decimal::ZERO);
            assert!(trade.estimated_value_base >= rules.min_notional().unwrap());
        }
    }

    #[test]
    fn identical_inputs_produce_identical_plans() {
        let fx = fixture();
        let a = plan(&fx.inputs());
        let b = plan(&fx.inputs());
        assert_eq!(
            serde_json::to_string(&a.trades).unwrap(),
            serde_json::to_string(&b.trades).unwrap()
        );
        assert_eq!(a.total_fees_usd, b.total_fees_usd);
        assert_eq!(
            serde_json::to_string(&a.projected_balances).unwrap(),
            serde_json::to_string(&b.projected_balances).unwrap()
        );
    }

    #[test]
    fn empty_portfolio_yields_empty_plan() {
        let mut fx = fixture();
        fx.balances = BTreeMap::from([("USDT".to_string(), dec!(0))]);
        fx.targets = BTreeMap::new();

        let result = plan(&fx.inputs());
        assert!(result.trades.is_empty());
    }

    #[test]
    fn missing_exchange_rules_drop_the_asset() {
        let mut fx = fixture();
        fx.exchange_info.remove("BTCUSDT");

        let result = plan(&fx.inputs());
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].asset, "ETH");
    }

    #[test]
    fn non_usd_base_falls_back_to_base_units() {
        // No stable-coin pair for the base anywhere: thresholds and reported
        // values stay in base units.
        let fx = Fixture {
            balances: BTreeMap::from([
                ("ALT".to_string(), dec!(1000)),
                ("BTC".to_string(), dec!(0)),
            ]),
            prices: PriceMap::from([("ALTBTC".to_string(), dec!(0.1))]),
            exchange_info: HashMap::from([pair_rules("ALTBTC", "1", "0.1")]),
            targets: BTreeMap::from([
                ("ALT".to_string(), dec!(50)),
                ("BTC".to_string(), dec!(50)),
            ]),
            eligible: ["ALT", "BTC"].iter().map(|s| s.to_string()).collect(),
            min_trade_value_usd: dec!(10),
            trade_fee_pct: dec!(0),
        };

        let inputs = PlanInputs {
            base_pair: "BTC",
            ..fx.inputs()
        };
        let result = plan(&inputs);

        assert_eq!(result.trades.len(), 1);
        let sell = &result.trades[0];
        assert_eq!(sell.asset, "ALT");
        assert_eq!(sell.side, TradeSide::Sell);
        assert_eq!(sell.quantity, dec!(500));
        // No USD rate resolvable: the USD figure equals the base figure.
        assert_eq!(sell.estimated_value_usd, sell.estimated_value_base);
        assert_eq!(sell.estimated_value_base, dec!(50.0));
        assert!(result.projected_balances["ALT"].value_usd.is_none());
    }

    #[test]
    fn zero_fee_projection_conserves_value_exactly() {
        let mut fx = fixture();
        fx.trade_fee_pct = dec!(0);
        let result = plan(&fx.inputs());

        let projected_total: Decimal = result
            .projected_balances
            .values()
            .map(|p| p.value_in_base)
            .sum();
        assert_eq!(projected_total, dec!(100000));
        assert_eq!(result.total_fees_usd, Decimal::ZERO);
    }
}
