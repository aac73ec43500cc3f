// =============================================================================
// Crate-wide error type
// =============================================================================
//
// Invalid-credential failures get their own variants because retrying them is
// pointless: the caller must surface them to the operator instead. Everything
// the exchange or ranking provider reports with a (code, message) pair is
// carried verbatim.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RebalancerError {
    /// The exchange rejected our API key or signature (codes -2014/-2015/-1022).
    #[error("invalid exchange credentials (code {code}): {message}")]
    InvalidExchangeCredentials { code: i64, message: String },

    /// Any other exchange API error, carried verbatim.
    #[error("exchange API error (code {code}): {message}")]
    ExchangeApi { code: i64, message: String },

    /// The ranking provider rejected or exhausted our API key (codes 1001/1002).
    #[error("invalid ranking API key (code {code}): {message}")]
    InvalidRankingKey { code: i64, message: String },

    /// Any other ranking provider error, carried verbatim.
    #[error("ranking API error (code {code}): {message}")]
    RankingApi { code: i64, message: String },

    /// Network-level failure that survived the retry policy.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Stored credentials could not be decrypted (master key changed or lost).
    #[error("failed to decrypt stored credentials: {0}")]
    DecryptionFailed(String),

    /// A rebalance cycle is already in flight; duplicate triggers fail fast.
    #[error("a rebalance cycle is already in progress")]
    Conflict,

    /// History store failure.
    #[error("history store error: {0}")]
    History(#[from] sqlx::Error),

    /// Contract violation on engine or settings inputs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Anything else that escaped the phases above.
    #[error("{0}")]
    Unexpected(String),
}

impl RebalancerError {
    /// True for the credential variants of either upstream provider.
    pub fn is_invalid_credentials(&self) -> bool {
        matches!(
            self,
            Self::InvalidExchangeCredentials { .. } | Self::InvalidRankingKey { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RebalancerError>;
