//! Session-scoped facade wiring every sync component together.
//!
//! One `SyncManager` is built per process or session and passed by reference.
//! Several managers can share one backend, which is how the tests model
//! multiple devices.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use workspace_sync_core::local_store::LocalStore;
use workspace_sync_core::sync::{
    DeviceIdentity, PreferenceRecord, PreferencesPatch, SyncDataType, SyncPayload,
    WorkspaceStateSink, WorkspaceStore,
};

use crate::client::RestRecordStore;
use crate::config::SyncConfig;
use crate::debounce::DebouncedWriter;
use crate::error::{CloudSyncError, Result};
use crate::gateway::CloudPersistenceGateway;
use crate::memory::MemoryBackend;
use crate::migration::{LocalToCloudMigrator, MigrationReport};
use crate::realtime::{
    ChangeCallback, ChangeFeed, ChannelSpec, ErrorCallback, RealtimeSocketFeed, ReconnectPolicy,
    SubscriptionHandle, SubscriptionManager, SubscriptionStatus,
};
use crate::router::ChangeNotificationRouter;
use crate::store::RecordStore;

pub const WORKSPACE_CHANNEL: &str = "workspace-sync";
pub const PREFERENCES_CHANNEL: &str = "user-preferences";

/// The two halves of a backend: keyed rows and their change feed.
#[derive(Clone)]
pub struct SyncBackend {
    pub records: Arc<dyn RecordStore>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl SyncBackend {
    /// REST records plus the realtime websocket for a configured backend.
    pub fn remote(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            records: Arc::new(RestRecordStore::new(config)?),
            feed: Arc::new(RealtimeSocketFeed::new(config)?),
        })
    }

    pub fn memory(backend: &MemoryBackend) -> Self {
        Self {
            records: Arc::new(backend.clone()),
            feed: Arc::new(backend.clone()),
        }
    }
}

pub struct SyncManager {
    config: SyncConfig,
    identity: Arc<DeviceIdentity>,
    gateway: Arc<CloudPersistenceGateway>,
    debouncer: DebouncedWriter,
    subscriptions: Option<SubscriptionManager>,
    migrator: LocalToCloudMigrator,
    store: Arc<WorkspaceStore>,
}

impl SyncManager {
    /// `backend` is `None` when sync is disabled; every remote operation then
    /// returns [`CloudSyncError::NotConfigured`] and local state keeps working.
    pub fn new(config: SyncConfig, local: Arc<dyn LocalStore>, backend: Option<SyncBackend>) -> Self {
        let identity = Arc::new(DeviceIdentity::new(Arc::clone(&local)));
        let (records, subscriptions) = match backend {
            Some(backend) => (
                Some(backend.records),
                Some(SubscriptionManager::new(
                    backend.feed,
                    ReconnectPolicy::from_config(&config),
                )),
            ),
            None => (None, None),
        };
        let gateway = Arc::new(CloudPersistenceGateway::new(records, Arc::clone(&identity)));
        let migrator = LocalToCloudMigrator::new(local, Arc::clone(&gateway));

        Self {
            config,
            identity,
            gateway,
            debouncer: DebouncedWriter::new(),
            subscriptions,
            migrator,
            store: Arc::new(WorkspaceStore::new()),
        }
    }

    /// Connects to the configured remote backend, or runs local-only when the
    /// configuration is absent or unusable.
    pub fn from_config(config: SyncConfig, local: Arc<dyn LocalStore>) -> Self {
        let backend = if config.is_configured() {
            SyncBackend::remote(&config)
                .inspect_err(|e| warn!("[CloudSync] Remote backend unavailable: {}", e))
                .ok()
        } else {
            debug!(
                "[CloudSync] {}",
                config.missing_reason().unwrap_or("sync not configured")
            );
            None
        };
        Self::new(config, local, backend)
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn is_enabled(&self) -> bool {
        self.gateway.is_enabled()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Local workspace state that remote changes fold into.
    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<CloudPersistenceGateway> {
        &self.gateway
    }

    pub async fn save(&self, owner_id: &str, payload: &SyncPayload) -> Result<()> {
        self.gateway.save(owner_id, payload).await
    }

    pub async fn load(
        &self,
        owner_id: &str,
        data_type: SyncDataType,
    ) -> Result<Option<SyncPayload>> {
        self.gateway.load(owner_id, data_type).await
    }

    pub async fn load_all(&self, owner_id: &str) -> Result<BTreeMap<SyncDataType, SyncPayload>> {
        self.gateway.load_all(owner_id).await
    }

    /// Applies `patch` locally, then upserts it. The remote `ui_flags` column
    /// is replaced wholesale, so the merged local flag set is sent.
    pub async fn save_preferences(&self, owner_id: &str, patch: &PreferencesPatch) -> Result<()> {
        self.store.patch_preferences(owner_id, patch);
        let mut outgoing = patch.clone();
        if outgoing.ui_flags.is_some() {
            outgoing.ui_flags = self.store.preferences().map(|prefs| prefs.ui_flags);
        }
        self.gateway.save_preferences(owner_id, &outgoing).await
    }

    pub async fn load_preferences(&self, owner_id: &str) -> Result<Option<PreferenceRecord>> {
        self.gateway.load_preferences(owner_id).await
    }

    /// Debounced save: bursts for the same `(owner, data_type)` collapse into
    /// one write of the latest payload after the configured idle window.
    pub fn schedule_save(&self, owner_id: &str, payload: SyncPayload) {
        if !self.gateway.is_enabled() {
            return;
        }
        let key = format!("{}:{}", owner_id, payload.data_type());
        let gateway = Arc::clone(&self.gateway);
        let owner = owner_id.to_string();
        self.debouncer.schedule(
            key,
            payload,
            move |payload: SyncPayload| async move {
                // Failures are logged by the gateway; the local state stays.
                let _ = gateway.save(&owner, &payload).await;
            },
            self.config.debounce_delay,
        );
    }

    /// Optimistic local update followed by a debounced remote save.
    pub fn apply_local_change(&self, owner_id: &str, payload: SyncPayload) {
        self.store.replace(payload.clone());
        self.schedule_save(owner_id, payload);
    }

    /// Loads all remote state for `owner_id` into the local store. Returns
    /// how many record types were applied.
    pub async fn hydrate(&self, owner_id: &str) -> Result<usize> {
        let records = self.gateway.load_all(owner_id).await?;
        let applied = records.len();
        for payload in records.into_values() {
            self.store.replace(payload);
        }
        match self.gateway.load_preferences_patch(owner_id).await {
            Ok(Some(preferences)) => self.store.merge_preferences(owner_id, &preferences),
            Ok(None) => {}
            Err(e) => debug!("[CloudSync] Hydrate without preferences: {}", e),
        }
        info!("[CloudSync] Hydrated {} record type(s) for {}", applied, owner_id);
        Ok(applied)
    }

    /// Router that folds `owner_id`'s changes into `sink`, suppressing echoes
    /// of this device's writes.
    pub fn router(
        &self,
        owner_id: &str,
        sink: Arc<dyn WorkspaceStateSink>,
    ) -> Arc<ChangeNotificationRouter> {
        Arc::new(ChangeNotificationRouter::new(
            Arc::clone(&self.identity),
            sink,
            owner_id,
            self.config.records_table.clone(),
            self.config.preferences_table.clone(),
        ))
    }

    fn subscriptions(&self) -> Result<&SubscriptionManager> {
        self.subscriptions
            .as_ref()
            .ok_or_else(|| CloudSyncError::not_configured("backend not configured"))
    }

    pub async fn subscribe(
        &self,
        spec: ChannelSpec,
        on_change: ChangeCallback,
        on_error: Option<ErrorCallback>,
    ) -> Result<SubscriptionHandle> {
        if spec.owner_id.trim().is_empty() {
            return Err(CloudSyncError::not_configured("owner id missing"));
        }
        Ok(self.subscriptions()?.subscribe(spec, on_change, on_error).await)
    }

    /// Live workspace records for `owner_id`, applied to [`Self::store`].
    pub async fn subscribe_workspace(
        &self,
        owner_id: &str,
        on_error: Option<ErrorCallback>,
    ) -> Result<SubscriptionHandle> {
        let spec = ChannelSpec::new(WORKSPACE_CHANNEL, &self.config.records_table, owner_id);
        let router = self.router(owner_id, self.store.clone());
        self.subscribe(spec, router.into_callback(), on_error).await
    }

    pub async fn subscribe_preferences(
        &self,
        owner_id: &str,
        on_error: Option<ErrorCallback>,
    ) -> Result<SubscriptionHandle> {
        let spec = ChannelSpec::new(PREFERENCES_CHANNEL, &self.config.preferences_table, owner_id);
        let router = self.router(owner_id, self.store.clone());
        self.subscribe(spec, router.into_callback(), on_error).await
    }

    pub fn subscription_status(&self, channel_key: &str) -> Option<SubscriptionStatus> {
        self.subscriptions
            .as_ref()
            .and_then(|subscriptions| subscriptions.status(channel_key))
    }

    pub fn active_channels(&self) -> Vec<String> {
        self.subscriptions
            .as_ref()
            .map(SubscriptionManager::active_channels)
            .unwrap_or_default()
    }

    pub async fn migrate_once(&self, owner_id: &str) -> Result<MigrationReport> {
        self.migrator.migrate_once(owner_id).await
    }

    /// Flushes pending debounced writes, then closes every channel.
    pub async fn shutdown(&self) {
        let flushed = self.debouncer.flush_all().await;
        if let Some(subscriptions) = &self.subscriptions {
            subscriptions.unsubscribe_all().await;
        }
        info!("[CloudSync] Shut down ({} pending write(s) flushed)", flushed);
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("enabled", &self.is_enabled())
            .field("identity", &self.identity)
            .field("active_channels", &self.active_channels())
            .finish()
    }
}
