//! In-process backend implementing both [`RecordStore`] and [`ChangeFeed`].
//!
//! Several `SyncManager`s sharing one `MemoryBackend` behave like devices
//! sharing one hosted backend: upserts replace the row for their key and are
//! pushed to every matching open channel, the writer's own included.

use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use workspace_sync_core::sync::SyncDataType;

use crate::config::{DEFAULT_PREFERENCES_TABLE, DEFAULT_RECORDS_TABLE};
use crate::error::{CloudSyncError, Result};
use crate::realtime::{ChangeFeed, ChangeKind, ChannelSignal, ChannelSpec, FeedChannel, RowChange};
use crate::store::RecordStore;
use crate::types::{PreferencesRow, SyncRecordRow};

struct OpenChannel {
    id: u64,
    spec: ChannelSpec,
    sender: mpsc::UnboundedSender<ChannelSignal>,
}

struct MemoryInner {
    records_table: String,
    preferences_table: String,
    records: Mutex<BTreeMap<(String, String), SyncRecordRow>>,
    preferences: Mutex<BTreeMap<String, PreferencesRow>>,
    channels: Mutex<Vec<OpenChannel>>,
    reachable: AtomicBool,
    failing_joins: AtomicU32,
    next_channel_id: AtomicU64,
    record_writes: AtomicUsize,
    preference_writes: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryInner {
    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CloudSyncError::backend("backend unreachable"))
        }
    }

    fn publish(&self, change: RowChange) {
        let Some(row) = change.row() else {
            return;
        };
        let mut channels = lock(&self.channels);
        channels.retain(|channel| {
            if !channel.spec.matches(&change.table, row) {
                return true;
            }
            channel
                .sender
                .send(ChannelSignal::Change(change.clone()))
                .is_ok()
        });
    }

    fn remove_channel(&self, id: u64) {
        lock(&self.channels).retain(|channel| channel.id != id);
    }
}

/// Shared in-memory backend. Cloning shares state.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_tables(DEFAULT_RECORDS_TABLE, DEFAULT_PREFERENCES_TABLE)
    }

    pub fn with_tables(records_table: &str, preferences_table: &str) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                records_table: records_table.to_string(),
                preferences_table: preferences_table.to_string(),
                records: Mutex::new(BTreeMap::new()),
                preferences: Mutex::new(BTreeMap::new()),
                channels: Mutex::new(Vec::new()),
                reachable: AtomicBool::new(true),
                failing_joins: AtomicU32::new(0),
                next_channel_id: AtomicU64::new(1),
                record_writes: AtomicUsize::new(0),
                preference_writes: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulates losing (or regaining) the network. Going offline also
    /// errors every open channel.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.break_channels("connection lost");
        }
    }

    /// Rejects the next `count` channel joins with an error.
    pub fn fail_joins(&self, count: u32) {
        self.inner.failing_joins.store(count, Ordering::SeqCst);
    }

    /// Sends an error to every open channel and forgets them.
    pub fn break_channels(&self, reason: &str) {
        let channels = std::mem::take(&mut *lock(&self.inner.channels));
        for channel in channels {
            let _ = channel.sender.send(ChannelSignal::Error(reason.to_string()));
        }
    }

    /// Channel joins attempted so far, rejected ones included.
    pub fn channel_opens(&self) -> u64 {
        self.inner.next_channel_id.load(Ordering::SeqCst) - 1
    }

    pub fn open_channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    pub fn record_count(&self) -> usize {
        lock(&self.inner.records).len()
    }

    /// Successful record upserts so far.
    pub fn record_writes(&self) -> usize {
        self.inner.record_writes.load(Ordering::SeqCst)
    }

    pub fn preference_writes(&self) -> usize {
        self.inner.preference_writes.load(Ordering::SeqCst)
    }

    pub fn record(&self, owner_id: &str, data_type: SyncDataType) -> Option<SyncRecordRow> {
        lock(&self.inner.records)
            .get(&(owner_id.to_string(), data_type.as_str().to_string()))
            .cloned()
    }

    /// Upserts a record row without the reachability check, as another
    /// client writing directly to the backend would.
    pub fn inject_record(&self, row: SyncRecordRow) -> Result<()> {
        self.store_record(row)
    }

    fn store_record(&self, mut row: SyncRecordRow) -> Result<()> {
        if row.updated_at.is_none() {
            row.updated_at = Some(chrono::Utc::now().to_rfc3339());
        }
        let new_value = serde_json::to_value(&row)?;
        let previous = lock(&self.inner.records)
            .insert((row.user_id.clone(), row.data_type.clone()), row);
        self.inner.record_writes.fetch_add(1, Ordering::SeqCst);

        let old_value = previous.map(serde_json::to_value).transpose()?;
        self.inner.publish(RowChange {
            table: self.inner.records_table.clone(),
            kind: if old_value.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            },
            new: Some(new_value),
            old: old_value,
            commit_timestamp: Some(chrono::Utc::now().to_rfc3339()),
        });
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryBackend {
    async fn upsert_record(&self, row: &SyncRecordRow) -> Result<()> {
        self.inner.ensure_reachable()?;
        self.store_record(row.clone())
    }

    async fn fetch_record(
        &self,
        owner_id: &str,
        data_type: SyncDataType,
    ) -> Result<Option<SyncRecordRow>> {
        self.inner.ensure_reachable()?;
        Ok(self.record(owner_id, data_type))
    }

    async fn upsert_preferences(&self, row: &PreferencesRow) -> Result<()> {
        self.inner.ensure_reachable()?;

        let (merged, previous) = {
            let mut preferences = lock(&self.inner.preferences);
            let previous = preferences.get(&row.user_id).cloned();
            let mut merged = previous.clone().unwrap_or_else(|| PreferencesRow {
                user_id: row.user_id.clone(),
                ..PreferencesRow::default()
            });
            // Column-wise upsert: absent columns keep their stored value.
            if row.layout_mode.is_some() {
                merged.layout_mode = row.layout_mode;
            }
            if row.tab_open_behavior.is_some() {
                merged.tab_open_behavior = row.tab_open_behavior;
            }
            if row.startup_behavior.is_some() {
                merged.startup_behavior = row.startup_behavior;
            }
            if row.ui_flags.is_some() {
                merged.ui_flags = row.ui_flags.clone();
            }
            merged.device_id = row.device_id.clone();
            merged.updated_at = row
                .updated_at
                .clone()
                .or_else(|| Some(chrono::Utc::now().to_rfc3339()));
            preferences.insert(row.user_id.clone(), merged.clone());
            (merged, previous)
        };
        self.inner.preference_writes.fetch_add(1, Ordering::SeqCst);

        let old_value = previous.map(serde_json::to_value).transpose()?;
        self.inner.publish(RowChange {
            table: self.inner.preferences_table.clone(),
            kind: if old_value.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            },
            new: Some(serde_json::to_value(&merged)?),
            old: old_value,
            commit_timestamp: merged.updated_at.clone(),
        });
        Ok(())
    }

    async fn fetch_preferences(&self, owner_id: &str) -> Result<Option<PreferencesRow>> {
        self.inner.ensure_reachable()?;
        Ok(lock(&self.inner.preferences).get(owner_id).cloned())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn open_channel(&self, spec: &ChannelSpec) -> Result<Box<dyn FeedChannel>> {
        self.inner.ensure_reachable()?;

        let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::unbounded_channel();

        let rejected = self
            .inner
            .failing_joins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            debug!("[MemoryBackend] Rejecting join for {}", spec.channel_key());
            let _ = sender.send(ChannelSignal::Error("join rejected".to_string()));
        } else {
            let _ = sender.send(ChannelSignal::Subscribed);
            lock(&self.inner.channels).push(OpenChannel {
                id,
                spec: spec.clone(),
                sender,
            });
        }

        Ok(Box::new(MemoryChannel {
            id,
            receiver,
            backend: Arc::downgrade(&self.inner),
        }))
    }
}

struct MemoryChannel {
    id: u64,
    receiver: mpsc::UnboundedReceiver<ChannelSignal>,
    backend: Weak<MemoryInner>,
}

impl MemoryChannel {
    fn detach(&self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.remove_channel(self.id);
        }
    }
}

#[async_trait]
impl FeedChannel for MemoryChannel {
    async fn next_signal(&mut self) -> Option<ChannelSignal> {
        self.receiver.recv().await
    }

    async fn close(&mut self) {
        self.detach();
        self.receiver.close();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.detach();
    }
}
