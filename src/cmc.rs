// =============================================================================
// CoinMarketCap ranking client — top-N eligibility set
// =============================================================================
//
// The ranking provider is consulted once per cycle for the set of symbols
// inside the configured rank ceiling; nothing else from the listing payload
// is kept. Responses carry their own status envelope, so an HTTP 200 can
// still be an API error. Codes 1001/1002 mean the key is invalid or its plan
// is exhausted, which retrying cannot fix.
// =============================================================================

use std::collections::HashSet;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use tracing::{debug, instrument, warn};

use crate::backoff::{self, MAX_ATTEMPTS};
use crate::error::{RebalancerError, Result};

/// Ranking provider error codes that indicate an invalid or exhausted key.
const INVALID_KEY_CODES: [i64; 2] = [1001, 1002];

/// CoinMarketCap REST client.
pub struct CmcClient {
    base_url: String,
    client: reqwest::Client,
}

impl CmcClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://pro-api.coinmarketcap.com")
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-CMC_PRO_API_KEY", val);
        }
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "CmcClient initialised");

        Self { base_url, client }
    }

    /// Send one GET request, retrying transient failures with backoff, and
    /// verify the provider's status envelope.
    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<serde_json::Value> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let request = self
                .client
                .get(format!("{}{}", self.base_url, path))
                .query(params);

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if backoff::is_retryable_status(status) && attempt < MAX_ATTEMPTS {
                        let delay = backoff::delay_for_attempt(attempt);
                        warn!(
                            %path,
                            %status,
                            attempt,
                            delay_secs = delay.as_secs(),
                            "transient ranking provider error, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let body: serde_json::Value =
                        resp.json().await.unwrap_or_else(|_| serde_json::json!({}));
                    let envelope = body.get("status").cloned().unwrap_or_default();
                    let code = envelope
                        .get("error_code")
                        .and_then(|v| v.as_i64())
                        .unwrap_or_else(|| i64::from(status.as_u16()));
                    let message = envelope
                        .get("error_message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown ranking provider error")
                        .to_string();

                    if status.is_success() && code == 0 {
                        return Ok(body);
                    }

                    return Err(
                        if INVALID_KEY_CODES.contains(&code)
                            || status == reqwest::StatusCode::UNAUTHORIZED
                        {
                            RebalancerError::InvalidRankingKey { code, message }
                        } else {
                            RebalancerError::RankingApi { code, message }
                        },
                    );
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

    /// Symbols of the top `limit` ranked assets, converted against `convert`.
    #[instrument(skip(self), name = "cmc::top_symbols")]
    pub async fn top_symbols(&self, limit: u32, convert: &str) -> Result<HashSet<String>> {
        let params = [
            ("limit", limit.to_string()),
            ("convert", convert.to_string()),
        ];
        let body = self
            .get("/v1/cryptocurrency/listings/latest", &params)
            .await?;

        let mut symbols = HashSet::new();
        if let Some(data) = body.get("data").and_then(|v| v.as_array()) {
            for item in data {
                if let Some(symbol) = item.get("symbol").and_then(|v| v.as_str()) {
                    symbols.insert(symbol.to_uppercase());
                }
            }
        }

        debug!(limit, count = symbols.len(), "eligible symbols fetched");
        Ok(symbols)
    }

    /// Probe the key-info endpoint to validate the API key. Any API-level
    /// failure here is reported as an invalid key.
    #[instrument(skip(self), name = "cmc::test_connectivity")]
    pub async fn test_connectivity(&self) -> Result<()> {
        match self.get("/v1/key/info", &[]).await {
            Ok(_) => Ok(()),
            Err(RebalancerError::RankingApi { code, message }) => {
                Err(RebalancerError::InvalidRankingKey {
                    code,
                    message: format!("API key validation failed: {message}"),
                })
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for CmcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmcClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
