//! Change-feed subscriptions.
//!
//! A [`ChangeFeed`] opens one channel per [`ChannelSpec`]; the
//! [`SubscriptionManager`] keeps at most one live subscription per channel key
//! and drives reconnects with capped exponential backoff.

mod manager;
mod socket;

pub use manager::{
    ChangeCallback, ErrorCallback, ReconnectPolicy, SubscriptionHandle, SubscriptionManager,
    SubscriptionStatus,
};
pub use socket::RealtimeSocketFeed;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::OWNER_COLUMN;

/// Secondary equality filter narrowing a channel to one sub-resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFilter {
    pub column: String,
    pub value: String,
}

/// What a channel listens to: one table, one owner, optionally one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub channel_name: String,
    pub table: String,
    pub owner_id: String,
    pub resource: Option<ResourceFilter>,
}

impl ChannelSpec {
    pub fn new(
        channel_name: impl Into<String>,
        table: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            table: table.into(),
            owner_id: owner_id.into(),
            resource: None,
        }
    }

    pub fn with_resource(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.resource = Some(ResourceFilter {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// Identity of the subscription; one live subscription per key.
    pub fn channel_key(&self) -> String {
        match &self.resource {
            Some(resource) => format!(
                "{}:{}:{}",
                self.channel_name, self.owner_id, resource.value
            ),
            None => format!("{}:{}", self.channel_name, self.owner_id),
        }
    }

    /// Server-side filter expression. The backend accepts a single equality,
    /// so the sub-resource wins when present and the owner is checked locally.
    pub fn server_filter(&self) -> String {
        match &self.resource {
            Some(resource) => format!("{}=eq.{}", resource.column, resource.value),
            None => format!("{}=eq.{}", OWNER_COLUMN, self.owner_id),
        }
    }

    /// True when `row` of `table` belongs to this channel.
    pub fn matches(&self, table: &str, row: &serde_json::Value) -> bool {
        if table != self.table {
            return false;
        }
        if row.get(OWNER_COLUMN).and_then(|v| v.as_str()) != Some(self.owner_id.as_str()) {
            return false;
        }
        match &self.resource {
            Some(resource) => column_equals(row, &resource.column, &resource.value),
            None => true,
        }
    }
}

fn column_equals(row: &serde_json::Value, column: &str, expected: &str) -> bool {
    match row.get(column) {
        Some(serde_json::Value::String(value)) => value == expected,
        Some(serde_json::Value::Number(value)) => value.to_string() == expected,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change pushed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table: String,
    pub kind: ChangeKind,
    pub new: Option<serde_json::Value>,
    pub old: Option<serde_json::Value>,
    pub commit_timestamp: Option<String>,
}

impl RowChange {
    /// Row image to match and route on: the new row, or the old one for deletes.
    pub fn row(&self) -> Option<&serde_json::Value> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// Signals a channel yields over its lifetime.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// Backend acknowledged the join.
    Subscribed,
    Change(RowChange),
    Error(String),
    TimedOut,
    Closed,
}

/// An open channel on the change feed.
#[async_trait]
pub trait FeedChannel: Send {
    /// Next signal, or `None` once the underlying stream ended.
    async fn next_signal(&mut self) -> Option<ChannelSignal>;

    /// Leaves the channel. Safe to call more than once.
    async fn close(&mut self);
}

/// Backend publish/subscribe API filtered by table and column predicate.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn open_channel(&self, spec: &ChannelSpec) -> Result<Box<dyn FeedChannel>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_key_includes_resource_when_present() {
        let spec = ChannelSpec::new("workspace-sync", "workspace_sync", "owner-1");
        assert_eq!(spec.channel_key(), "workspace-sync:owner-1");
        assert_eq!(spec.server_filter(), "user_id=eq.owner-1");

        let spec = spec.with_resource("canvas_id", "c-9");
        assert_eq!(spec.channel_key(), "workspace-sync:owner-1:c-9");
        assert_eq!(spec.server_filter(), "canvas_id=eq.c-9");
    }

    #[test]
    fn matches_checks_table_owner_and_resource() {
        let spec = ChannelSpec::new("items", "canvas_items", "owner-1").with_resource("canvas_id", "7");
        assert!(spec.matches("canvas_items", &json!({ "user_id": "owner-1", "canvas_id": 7 })));
        assert!(!spec.matches("canvas_items", &json!({ "user_id": "owner-2", "canvas_id": 7 })));
        assert!(!spec.matches("canvas_items", &json!({ "user_id": "owner-1", "canvas_id": 8 })));
        assert!(!spec.matches("other", &json!({ "user_id": "owner-1", "canvas_id": 7 })));
    }
}
