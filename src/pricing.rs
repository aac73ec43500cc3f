// =============================================================================
// Price conversion helpers
// =============================================================================
//
// The exchange ticker feed quotes each pair in only one direction, so the
// inverse must be derived. USD conversion prefers a direct stable-coin rate
// over routing through the base pair to avoid compounding rounding.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;

/// Ticker map: pair symbol (`FROM||TO`) to last price.
pub type PriceMap = HashMap<String, Decimal>;

/// USD-pegged coins treated as exactly $1, in lookup order.
pub const STABLE_COINS: [&str; 4] = ["USDT", "BUSD", "USDC", "TUSD"];

/// Price of one unit of `from` denominated in `to`, if the ticker map can
/// resolve it in either direction. A pair that is present with a zero price
/// counts as missing.
pub fn rate(prices: &PriceMap, from: &str, to: &str) -> Option<Decimal> {
    let from = from.to_uppercase();
    let to = to.to_uppercase();

    if from == to {
        return Some(Decimal::ONE);
    }

    if let Some(price) = prices.get(&format!("{from}{to}")) {
        if price.is_zero() {
            return None;
        }
        return Some(*price);
    }

    if let Some(price) = prices.get(&format!("{to}{from}")) {
        if price.is_zero() {
            return None;
        }
        return Some(Decimal::ONE / *price);
    }

    None
}

/// How many USD one unit of `base_pair` is worth.
///
/// Stable coins are pegged at $1. Any other base is converted through the
/// stable coins in order, with a literal `USD` pair as last resort.
pub fn base_to_usd(prices: &PriceMap, base_pair: &str) -> Option<Decimal> {
    let base_pair = base_pair.to_uppercase();

    if STABLE_COINS.contains(&base_pair.as_str()) {
        return Some(Decimal::ONE);
    }

    for stable in STABLE_COINS {
        if let Some(r) = rate(prices, &base_pair, stable) {
            return Some(r);
        }
    }

    rate(prices, &base_pair, "USD")
}

/// Price of `asset` denominated in the base pair.
pub fn asset_base_value(prices: &PriceMap, asset: &str, base_pair: &str) -> Option<Decimal> {
    rate(prices, asset, base_pair)
}

/// Price of `asset` denominated in USD.
///
/// A direct stable-coin or `USD` pair wins when one exists; otherwise the
/// value is composed from the base-pair leg and the base-to-USD leg, and is
/// `None` when either leg is missing.
pub fn asset_usd_value(prices: &PriceMap, asset: &str, base_pair: &str) -> Option<Decimal> {
    for quote in STABLE_COINS.iter().chain(std::iter::once(&"USD")) {
        if let Some(r) = rate(prices, asset, quote) {
            return Some(r);
        }
    }

    let base_rate = asset_base_value(prices, asset, base_pair)?;
    let usd_rate = base_to_usd(prices, base_pair)?;
    Some(base_rate * usd_rate)
}
