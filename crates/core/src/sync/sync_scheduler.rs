//! Default timings for the sync engine.

/// Idle window before a burst of local mutations is written.
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;

/// Base delay for change-feed reconnect backoff.
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Reconnect attempts before a channel is declared dead.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// How long a channel join may stay unacknowledged.
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 10;

/// Keep-alive cadence on change-feed sockets.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 25;

/// Timeout for record store requests.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
