//! Subscription lifecycle: join, reconnect with backoff, exhaustion, close.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use workspace_sync_core::sync::{can_reconnect, reconnect_delay};

use super::{ChangeFeed, ChannelSignal, ChannelSpec, FeedChannel, RowChange};
use crate::config::SyncConfig;
use crate::error::CloudSyncError;

/// Receives row changes for a subscription.
pub type ChangeCallback = Arc<dyn Fn(RowChange) + Send + Sync>;

/// Receives the terminal error once a subscription gives up.
pub type ErrorCallback = Arc<dyn Fn(CloudSyncError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribing,
    Subscribed,
    /// Waiting to rejoin; `attempt` is 1-based.
    Reconnecting { attempt: u32 },
    Exhausted,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub join_timeout: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay,
            max_attempts: config.max_reconnect_attempts,
            join_timeout: config.join_timeout,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

struct SubscriptionEntry {
    generation: u64,
    status: Arc<Mutex<SubscriptionStatus>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionEntry {
    /// Cancels the subscription task and waits for it to leave its channel.
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("[Realtime] Subscription task failed during shutdown: {}", e);
            }
        }
    }
}

struct ManagerInner {
    feed: Arc<dyn ChangeFeed>,
    policy: ReconnectPolicy,
    channels: Mutex<HashMap<String, SubscriptionEntry>>,
    /// Keys whose subscription gave up; cleared by resubscribe or unsubscribe.
    exhausted: Mutex<HashMap<String, u64>>,
    next_generation: AtomicU64,
}

impl ManagerInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, SubscriptionEntry>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn exhausted(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.exhausted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops the exhausted marker for `key`, for any generation when `None`.
    fn forget_exhausted(&self, key: &str, generation: Option<u64>) {
        let mut exhausted = self.exhausted();
        if exhausted
            .get(key)
            .is_some_and(|g| generation.map_or(true, |expected| expected == *g))
        {
            exhausted.remove(key);
        }
    }

    /// Swaps a live entry for an exhausted marker. The channel and task are
    /// gone afterwards; only the status is kept.
    fn retire_exhausted(&self, key: &str, generation: u64) {
        let mut channels = self.channels();
        if channels.get(key).is_some_and(|entry| entry.generation == generation) {
            channels.remove(key);
            self.exhausted().insert(key.to_string(), generation);
        }
    }

    /// Removes the entry for `key` only if it still belongs to `generation`.
    fn take_entry(&self, key: &str, generation: Option<u64>) -> Option<SubscriptionEntry> {
        let mut channels = self.channels();
        let owned = channels
            .get(key)
            .is_some_and(|entry| generation.map_or(true, |g| g == entry.generation));
        if owned {
            channels.remove(key)
        } else {
            None
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let channels = self.channels.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in channels.values() {
            entry.cancel.cancel();
        }
    }
}

/// Owns every change-feed subscription of one [`crate::SyncManager`].
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                feed,
                policy,
                channels: Mutex::new(HashMap::new()),
                exhausted: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribes to `spec`, replacing any live subscription on the same key.
    ///
    /// Row changes go to `on_change`. `on_error` is invoked once, with
    /// [`CloudSyncError::ChannelExhausted`], if the channel gives up.
    pub async fn subscribe(
        &self,
        spec: ChannelSpec,
        on_change: ChangeCallback,
        on_error: Option<ErrorCallback>,
    ) -> SubscriptionHandle {
        let key = spec.channel_key();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let status = Arc::new(Mutex::new(SubscriptionStatus::Subscribing));
        let cancel = CancellationToken::new();
        let worker = SubscriptionWorker {
            manager: Arc::downgrade(&self.inner),
            feed: Arc::clone(&self.inner.feed),
            policy: self.inner.policy.clone(),
            spec,
            key: key.clone(),
            generation,
            status: Arc::clone(&status),
            cancel: cancel.clone(),
            on_change,
            on_error,
        };

        {
            // Concurrent subscribers may insert while a previous entry shuts
            // down, so keep draining until the key is free under the lock.
            let mut channels = loop {
                let previous = {
                    let mut channels = self.inner.channels();
                    match channels.remove(&key) {
                        Some(previous) => previous,
                        None => break channels,
                    }
                };
                debug!("[Realtime] {} already subscribed, tearing down previous channel", key);
                previous.shutdown().await;
            };
            self.inner.forget_exhausted(&key, None);
            // Held across spawn so an immediately exhausted worker cannot try
            // to remove its entry before it is inserted.
            let task = tokio::spawn(worker.run());
            channels.insert(
                key.clone(),
                SubscriptionEntry {
                    generation,
                    status,
                    cancel,
                    task,
                },
            );
        }

        SubscriptionHandle {
            manager: Arc::downgrade(&self.inner),
            key,
            generation,
        }
    }

    /// Live status, or `Exhausted` for a key that gave up and has not been
    /// resubscribed or unsubscribed since.
    pub fn status(&self, channel_key: &str) -> Option<SubscriptionStatus> {
        let live = self
            .inner
            .channels()
            .get(channel_key)
            .map(|entry| *entry.status.lock().unwrap_or_else(|e| e.into_inner()));
        live.or_else(|| {
            self.inner
                .exhausted()
                .contains_key(channel_key)
                .then_some(SubscriptionStatus::Exhausted)
        })
    }

    pub fn active_channels(&self) -> Vec<String> {
        let mut keys = self.inner.channels().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Closes the subscription on `channel_key`, whatever its generation.
    pub async fn unsubscribe(&self, channel_key: &str) {
        self.inner.forget_exhausted(channel_key, None);
        if let Some(entry) = self.inner.take_entry(channel_key, None) {
            entry.shutdown().await;
            info!("[Realtime] {} closed", channel_key);
        }
    }

    pub async fn unsubscribe_all(&self) {
        self.inner.exhausted().clear();
        let entries = self.inner.channels().drain().collect::<Vec<_>>();
        for (key, entry) in entries {
            entry.shutdown().await;
            info!("[Realtime] {} closed", key);
        }
    }
}

/// Returned by [`SubscriptionManager::subscribe`]; closes that subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    manager: Weak<ManagerInner>,
    key: String,
    generation: u64,
}

impl SubscriptionHandle {
    pub fn channel_key(&self) -> &str {
        &self.key
    }

    /// Closes the subscription. Calling it again, or after the key was
    /// re-subscribed by someone else, is a no-op.
    pub async fn unsubscribe(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        manager.forget_exhausted(&self.key, Some(self.generation));
        if let Some(entry) = manager.take_entry(&self.key, Some(self.generation)) {
            entry.shutdown().await;
            info!("[Realtime] {} closed", self.key);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

enum PumpExit {
    Cancelled,
    Failed(String),
}

struct SubscriptionWorker {
    manager: Weak<ManagerInner>,
    feed: Arc<dyn ChangeFeed>,
    policy: ReconnectPolicy,
    spec: ChannelSpec,
    key: String,
    generation: u64,
    status: Arc<Mutex<SubscriptionStatus>>,
    cancel: CancellationToken,
    on_change: ChangeCallback,
    on_error: Option<ErrorCallback>,
}

impl SubscriptionWorker {
    fn transition(&self, status: SubscriptionStatus, attempts: u32) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        info!(
            "[Realtime] channel={} status={:?} attempts={}",
            self.key, status, attempts
        );
    }

    async fn run(self) {
        let mut attempts: u32 = 0;
        loop {
            let failure = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.transition(SubscriptionStatus::Closed, attempts);
                    return;
                }
                opened = self.feed.open_channel(&self.spec) => match opened {
                    Ok(mut channel) => {
                        let exit = self.pump(&mut channel, &mut attempts).await;
                        // The old channel is always left before any rejoin.
                        channel.close().await;
                        match exit {
                            PumpExit::Cancelled => {
                                self.transition(SubscriptionStatus::Closed, attempts);
                                return;
                            }
                            PumpExit::Failed(reason) => reason,
                        }
                    }
                    Err(e) => e.to_string(),
                },
            };

            if !can_reconnect(attempts, self.policy.max_attempts) {
                self.exhaust(attempts, &failure);
                return;
            }

            let delay = reconnect_delay(self.policy.base_delay, attempts);
            attempts += 1;
            warn!(
                "[Realtime] channel={} failed: {}. Reconnecting in {:?} (attempt {}/{})",
                self.key, failure, delay, attempts, self.policy.max_attempts
            );
            self.transition(SubscriptionStatus::Reconnecting { attempt: attempts }, attempts);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.transition(SubscriptionStatus::Closed, attempts);
                    return;
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// Forwards changes until the channel fails or the subscription is cancelled.
    async fn pump(&self, channel: &mut Box<dyn FeedChannel>, attempts: &mut u32) -> PumpExit {
        let join_deadline = Instant::now() + self.policy.join_timeout;
        let mut joined = false;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,
                _ = sleep_until(join_deadline), if !joined => {
                    return PumpExit::Failed(format!(
                        "join not acknowledged within {:?}",
                        self.policy.join_timeout
                    ));
                }
                signal = channel.next_signal() => match signal {
                    Some(ChannelSignal::Subscribed) => {
                        joined = true;
                        *attempts = 0;
                        self.transition(SubscriptionStatus::Subscribed, 0);
                    }
                    Some(ChannelSignal::Change(change)) => (self.on_change)(change),
                    Some(ChannelSignal::Error(message)) => return PumpExit::Failed(message),
                    Some(ChannelSignal::TimedOut) => {
                        return PumpExit::Failed("channel timed out".to_string());
                    }
                    Some(ChannelSignal::Closed) | None => {
                        return PumpExit::Failed("channel closed by backend".to_string());
                    }
                },
            }
        }
    }

    fn exhaust(&self, attempts: u32, failure: &str) {
        self.transition(SubscriptionStatus::Exhausted, attempts);
        log::error!(
            "[Realtime] channel={} giving up after {} reconnect attempts: {}",
            self.key, attempts, failure
        );
        if let Some(manager) = self.manager.upgrade() {
            manager.retire_exhausted(&self.key, self.generation);
        }
        if let Some(on_error) = &self.on_error {
            on_error(CloudSyncError::ChannelExhausted {
                channel: self.key.clone(),
                attempts,
            });
        }
    }
}
