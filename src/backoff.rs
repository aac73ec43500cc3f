// =============================================================================
// Shared retry policy for the upstream REST clients
// =============================================================================
//
// Both upstream providers get the same treatment: up to 3 attempts with an
// exponential wait clamped to [2s, 10s]. Credential errors never retry.
// =============================================================================

use std::time::Duration;

/// Maximum attempts per request, including the first one.
pub const MAX_ATTEMPTS: u32 = 3;

const MIN_WAIT_SECS: u64 = 2;
const MAX_WAIT_SECS: u64 = 10;

/// Wait after attempt number `attempt` (1-based): `2^(attempt-1)` seconds
/// clamped to the floor and cap, so the two retries that occur wait 2s each.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    let secs = (1u64 << exp).clamp(MIN_WAIT_SECS, MAX_WAIT_SECS);
    Duration::from_secs(secs)
}

/// True for HTTP statuses worth retrying: throttling and server-side faults.
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// True for transport errors worth retrying (connect failures, timeouts).
pub fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}
