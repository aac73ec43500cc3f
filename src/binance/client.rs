// =============================================================================
// Binance REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the rebalancer and Binance servers.
//
// Transient failures retry with exponential backoff; the timestamp and
// signature are recomputed on every attempt because a reused timestamp falls
// outside the recvWindow and fails repeatedly. Error codes -2014/-2015/-1022
// mean bad credentials and are surfaced without retrying.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use rust_decimal::Decimal;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::backoff::{self, MAX_ATTEMPTS};
use crate::error::{RebalancerError, Result};
use crate::pricing::PriceMap;
use crate::types::{PairRules, TradeSide};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance REST API client with HMAC-SHA256 request signing.
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// Exchange rules, populated on the first successful `exchange_info` call
    /// and reused for this client's lifetime.
    exchange_info_cache: RwLock<Option<HashMap<String, PairRules>>>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, "https://api.binance.com")
    }

    /// Same as [`BinanceClient::new`] with an explicit base URL (testnet,
    /// regional mirrors, local fakes).
    pub fn with_base_url(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "BinanceClient initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
            exchange_info_cache: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full parameter string for a signed request (appends
    /// timestamp, recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport with retry
    // -------------------------------------------------------------------------

    /// Send one API request, retrying transient failures with backoff.
    ///
    /// GET parameters travel in the query string; everything else goes in an
    /// urlencoded form body. Signed parameter strings are rebuilt per attempt.
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> Result<serde_json::Value> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let query = if signed {
                self.signed_query(params)
            } else {
                params.to_string()
            };

            let request = if method == Method::GET {
                let url = if query.is_empty() {
                    format!("{}{}", self.base_url, path)
                } else {
                    format!("{}{}?{}", self.base_url, path, query)
                };
                self.client.get(url)
            } else {
                self.client
                    .request(method.clone(), format!("{}{}", self.base_url, path))
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(query)
            };

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json().await.map_err(RebalancerError::Transport);
                    }

                    if backoff::is_retryable_status(status) && attempt < MAX_ATTEMPTS {
                        let delay = backoff::delay_for_attempt(attempt);
                        warn!(
                            %path,
                            %status,
                            attempt,
                            delay_secs = delay.as_secs(),
                            "transient exchange error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let body: serde_json::Value =
                        resp.json().await.unwrap_or_else(|_| serde_json::json!({}));
                    let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(-1);
                    let message = body
                        .get("msg")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown exchange error")
                        .to_string();

                    return Err(match code {
                        -2014 | -2015 | -1022 => {
                            RebalancerError::InvalidExchangeCredentials { code, message }
                        }
                        _ => RebalancerError::ExchangeApi { code, message },
                    });
                }
                Err(e) if backoff::is_retryable_transport(&e) && attempt < MAX_ATTEMPTS => {
                    let delay = backoff::delay_for_attempt(attempt);
                    warn!(
                        %path,
                        error = %e,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "transport error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// GET /api/v3/account (signed) — free balances per asset, zero balances
    /// filtered out, symbols uppercased.
    #[instrument(skip(self), name = "binance::balances")]
    pub async fn balances(&self) -> Result<BTreeMap<String, Decimal>> {
        let account = self
            .request(Method::GET, "/api/v3/account", "", true)
            .await?;

        let raw = account
            .get("balances")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                RebalancerError::Unexpected("account response missing 'balances' array".to_string())
            })?;

        let mut balances = BTreeMap::new();
        for entry in raw {
            let asset = entry.get("asset").and_then(|v| v.as_str()).unwrap_or("");
            let free: Decimal = entry
                .get("free")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            if !asset.is_empty() && free > Decimal::ZERO {
                balances.insert(asset.to_uppercase(), free);
            }
        }

        debug!(count = balances.len(), "account balances retrieved");
        Ok(balances)
    }

    /// Signed call used purely to validate credentials.
    #[instrument(skip(self), name = "binance::test_account")]
    pub async fn test_account(&self) -> Result<()> {
        self.request(Method::GET, "/api/v3/account", "", true)
            .await?;
        debug!("credentials validated against /api/v3/account");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/price (public) — last price for every pair.
    #[instrument(skip(self), name = "binance::all_prices")]
    pub async fn all_prices(&self) -> Result<PriceMap> {
        let body = self
            .request(Method::GET, "/api/v3/ticker/price", "", false)
            .await?;

        let raw = body.as_array().ok_or_else(|| {
            RebalancerError::Unexpected("ticker response is not an array".to_string())
        })?;

        let mut prices = PriceMap::with_capacity(raw.len());
        for entry in raw {
            let symbol = entry.get("symbol").and_then(|v| v.as_str()).unwrap_or("");
            let price: Option<Decimal> = entry
                .get("price")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok());
            if let Some(price) = price {
                if !symbol.is_empty() {
                    prices.insert(symbol.to_uppercase(), price);
                }
            }
        }

        debug!(count = prices.len(), "ticker prices fetched");
        Ok(prices)
    }

    /// GET /api/v3/exchangeInfo (public) — trading rules keyed by pair.
    ///
    /// The result is cached for this client's lifetime after the first
    /// successful call. When `symbols` is given, the filter is rendered as a
    /// single inline JSON array: `symbols=["BTCUSDT","ETHUSDT"]`.
    #[instrument(skip(self, symbols), name = "binance::exchange_info")]
    pub async fn exchange_info(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<HashMap<String, PairRules>> {
        if let Some(cached) = self.exchange_info_cache.read().clone() {
            debug!(count = cached.len(), "exchange info served from cache");
            return Ok(cached);
        }

        let params = match symbols {
            Some(list) if !list.is_empty() => symbols_param(list),
            _ => String::new(),
        };

        let body = self
            .request(Method::GET, "/api/v3/exchangeInfo", &params, false)
            .await?;

        let raw = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                RebalancerError::Unexpected(
                    "exchangeInfo response missing 'symbols' array".to_string(),
                )
            })?;

        let mut rules = HashMap::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_value::<PairRules>(entry.clone()) {
                Ok(pair) => {
                    rules.insert(pair.symbol.clone(), pair);
                }
                Err(e) => warn!(error = %e, "skipping malformed exchangeInfo entry"),
            }
        }

        debug!(count = rules.len(), "exchange info fetched and cached");
        *self.exchange_info_cache.write() = Some(rules.clone());
        Ok(rules)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v3/order (signed) — submit a market order. With `test` the
    /// validation-only endpoint /api/v3/order/test is used instead.
    ///
    /// `quantity` must already be a plain decimal string floored to the
    /// pair's step size.
    #[instrument(skip(self), name = "binance::create_order")]
    pub async fn create_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: &str,
        test: bool,
    ) -> Result<serde_json::Value> {
        let params = format!("symbol={symbol}&side={side}&type=MARKET&quantity={quantity}");
        let endpoint = if test {
            "/api/v3/order/test"
        } else {
            "/api/v3/order"
        };

        debug!(symbol, %side, quantity, test, "placing market order");
        let body = self.request(Method::POST, endpoint, &params, true).await?;
        debug!(symbol, %side, "market order accepted");
        Ok(body)
    }
}

/// Render the exchangeInfo symbol filter as an inline JSON array.
fn symbols_param(symbols: &[String]) -> String {
    let quoted: Vec<String> = symbols.iter().map(|s| format!("\"{s}\"")).collect();
    format!("symbols=[{}]", quoted.join(","))
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
