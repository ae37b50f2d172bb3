//! Backend configuration, read once at startup.

use std::time::Duration;
use workspace_sync_core::sync::{
    DEFAULT_DEBOUNCE_MS, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_JOIN_TIMEOUT_SECS,
    DEFAULT_RECONNECT_BASE_DELAY_MS, DEFAULT_REQUEST_TIMEOUT_SECS, MAX_RECONNECT_ATTEMPTS,
};

pub const BACKEND_URL_ENV: &str = "WORKSPACE_SYNC_URL";
pub const API_KEY_ENV: &str = "WORKSPACE_SYNC_API_KEY";
pub const ACCESS_TOKEN_ENV: &str = "WORKSPACE_SYNC_ACCESS_TOKEN";

pub const DEFAULT_RECORDS_TABLE: &str = "workspace_sync";
pub const DEFAULT_PREFERENCES_TABLE: &str = "user_preferences";

/// Values shipped in sample env files that must not count as configuration.
const PLACEHOLDER_VALUES: [&str; 6] = [
    "your-project-url",
    "your-anon-key",
    "your-api-key",
    "placeholder",
    "changeme",
    "undefined",
];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
    /// User session token; requests fall back to the API key when absent.
    pub access_token: Option<String>,
    pub records_table: String,
    pub preferences_table: String,
    pub debounce_delay: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            api_key: None,
            access_token: None,
            records_table: DEFAULT_RECORDS_TABLE.to_string(),
            preferences_table: DEFAULT_PREFERENCES_TABLE.to_string(),
            debounce_delay: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl SyncConfig {
    /// Config for a concrete backend. Placeholder values are discarded.
    pub fn new(backend_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            backend_url: normalize_setting(Some(backend_url.into()))
                .map(|url| url.trim_end_matches('/').to_string()),
            api_key: normalize_setting(Some(api_key.into())),
            ..Self::default()
        }
    }

    /// Reads the backend endpoint and key from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            backend_url: normalize_setting(lookup(BACKEND_URL_ENV))
                .map(|url| url.trim_end_matches('/').to_string()),
            api_key: normalize_setting(lookup(API_KEY_ENV)),
            access_token: normalize_setting(lookup(ACCESS_TOKEN_ENV)),
            ..Self::default()
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = normalize_setting(Some(token.into()));
        self
    }

    pub fn is_configured(&self) -> bool {
        self.backend_url.is_some() && self.api_key.is_some()
    }

    /// Token sent as the bearer credential.
    pub fn bearer_token(&self) -> Option<&str> {
        self.access_token.as_deref().or(self.api_key.as_deref())
    }

    /// Reason sync is disabled, for logging.
    pub fn missing_reason(&self) -> Option<&'static str> {
        match (&self.backend_url, &self.api_key) {
            (None, _) => Some("backend URL is not set"),
            (_, None) => Some("API key is not set"),
            _ => None,
        }
    }
}

fn normalize_setting(value: Option<String>) -> Option<String> {
    let value = value?.trim().to_string();
    if value.is_empty() {
        return None;
    }
    let lowered = value.to_ascii_lowercase();
    if PLACEHOLDER_VALUES.contains(&lowered.as_str()) || lowered.contains("your-project") {
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn configured_when_url_and_key_present() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            (BACKEND_URL_ENV, "https://sync.example.com/"),
            (API_KEY_ENV, "anon-key"),
        ]));
        assert!(config.is_configured());
        assert_eq!(config.backend_url.as_deref(), Some("https://sync.example.com"));
        assert_eq!(config.bearer_token(), Some("anon-key"));
    }

    #[test]
    fn placeholders_disable_sync() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            (BACKEND_URL_ENV, "https://your-project.example.co"),
            (API_KEY_ENV, "your-anon-key"),
        ]));
        assert!(!config.is_configured());
        assert_eq!(config.missing_reason(), Some("backend URL is not set"));

        let config = SyncConfig::new("https://sync.example.com", "  ");
        assert!(!config.is_configured());
        assert_eq!(config.missing_reason(), Some("API key is not set"));
    }

    #[test]
    fn access_token_takes_precedence_for_bearer() {
        let config = SyncConfig::new("https://sync.example.com", "anon-key")
            .with_access_token("session-token");
        assert_eq!(config.bearer_token(), Some("session-token"));
    }

    #[test]
    fn defaults_match_reconnect_policy() {
        let config = SyncConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.debounce_delay, Duration::from_millis(1000));
        assert_eq!(config.records_table, "workspace_sync");
    }
}
