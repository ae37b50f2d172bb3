//! Core helpers for sync engine orchestration: retry classes and backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy classification for backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

/// Classify HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> SyncRetryClass {
    match status {
        401 | 403 => SyncRetryClass::ReauthRequired,
        408 | 409 | 423 | 425 | 429 => SyncRetryClass::Retryable,
        500..=599 => SyncRetryClass::Retryable,
        _ => SyncRetryClass::Permanent,
    }
}

/// Reconnect delay for a channel that already failed `attempts` times:
/// `base * 2^attempts`.
pub fn reconnect_delay(base: Duration, attempts: u32) -> Duration {
    const MAX_EXPONENT: u32 = 16;

    base.saturating_mul(1_u32 << attempts.min(MAX_EXPONENT))
}

/// Whether another reconnect may be scheduled after `attempts` failures.
pub fn can_reconnect(attempts: u32, max_attempts: u32) -> bool {
    attempts < max_attempts
}
