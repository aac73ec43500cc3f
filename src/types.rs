// =============================================================================
// Shared types used across the Meridian rebalancing engine
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side as the exchange spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Terminal status of one rebalance cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    DryRun,
    Success,
    PartialSuccess,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DryRun => write!(f, "DRY_RUN"),
            Self::Success => write!(f, "SUCCESS"),
            Self::PartialSuccess => write!(f, "PARTIAL_SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRY_RUN" => Ok(Self::DryRun),
            "SUCCESS" => Ok(Self::Success),
            "PARTIAL_SUCCESS" => Ok(Self::PartialSuccess),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A single trade calculated by the engine, already validated against the
/// pair's lot-size and notional rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedTrade {
    /// The trading pair, e.g. `BTCUSDT`.
    pub symbol: String,
    /// The asset being traded, e.g. `BTC`.
    pub asset: String,
    pub side: TradeSide,
    /// Final quantity, an exact multiple of the pair's step size.
    pub quantity: Decimal,
    /// Trade value denominated in the base pair.
    pub estimated_value_base: Decimal,
    /// Trade value in USD (equals the base value when no USD rate resolves).
    pub estimated_value_usd: Decimal,
    /// Expected fee for this trade in USD.
    pub fee_cost_usd: Decimal,
    /// Why the engine proposed this trade (target vs current allocation).
    pub reason: String,
}

/// Post-trade simulation entry for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectedBalance {
    pub quantity: Decimal,
    pub value_in_base: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_usd: Option<Decimal>,
}

/// Output of the pure planning engine.
#[derive(Debug, Clone, Default)]
pub struct RebalancePlan {
    pub trades: Vec<ProposedTrade>,
    pub total_fees_usd: Decimal,
    pub projected_balances: BTreeMap<String, ProjectedBalance>,
}

/// Full outcome of one rebalance cycle, persisted as a single history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub is_dry_run: bool,
    pub message: String,
    pub trades: Vec<ProposedTrade>,
    pub errors: Vec<String>,
    pub total_fees_usd: Decimal,
    pub projected_balances: BTreeMap<String, ProjectedBalance>,
    pub total_value_usd_before: Option<Decimal>,
    pub total_value_usd_after: Option<Decimal>,
}

/// Trading rules for one pair as returned by the exchange. Filter kinds we do
/// not model are dropped during deserialisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRules {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<PairFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairFilter {
    pub filter_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_notional: Option<String>,
}

impl PairRules {
    fn filter(&self, kind: &str) -> Option<&PairFilter> {
        self.filters.iter().find(|f| f.filter_type == kind)
    }

    /// Step size from the `LOT_SIZE` filter, as the exchange's decimal string.
    pub fn step_size(&self) -> Option<&str> {
        self.filter("LOT_SIZE")?.step_size.as_deref()
    }

    /// Minimum notional from `MIN_NOTIONAL`, or `NOTIONAL` on pairs that
    /// carry the newer filter name.
    pub fn min_notional(&self) -> Option<Decimal> {
        let filter = self.filter("MIN_NOTIONAL").or_else(|| self.filter("NOTIONAL"))?;
        filter.min_notional.as_deref()?.parse().ok()
    }
}
