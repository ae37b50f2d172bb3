//! Keyed save/load over the remote record store.
//!
//! Every call returns an explicit result. Sync is optional: with no backend
//! configured or no owner id, calls return [`CloudSyncError::NotConfigured`]
//! without touching the network, and the condition is logged once.

use chrono::Utc;
use futures::future::join_all;
use log::{debug, log, warn, Level};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use workspace_sync_core::sync::{
    DeviceIdentity, PreferenceRecord, PreferencesPatch, SyncDataType, SyncPayload, SyncRecord,
    SyncRetryClass,
};

use crate::error::{CloudSyncError, Result};
use crate::store::RecordStore;
use crate::types::{PreferencesRow, SyncRecordRow};

/// Failed writes that the next mutation will retry are only warnings.
fn write_failure_level(err: &CloudSyncError) -> Level {
    match err.retry_class() {
        SyncRetryClass::Retryable => Level::Warn,
        SyncRetryClass::Permanent | SyncRetryClass::ReauthRequired => Level::Error,
    }
}

pub struct CloudPersistenceGateway {
    store: Option<Arc<dyn RecordStore>>,
    identity: Arc<DeviceIdentity>,
    warned_unconfigured: AtomicBool,
}

impl CloudPersistenceGateway {
    /// `store` is `None` when sync is disabled.
    pub fn new(store: Option<Arc<dyn RecordStore>>, identity: Arc<DeviceIdentity>) -> Self {
        Self {
            store,
            identity,
            warned_unconfigured: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    fn backend(&self, owner_id: &str) -> Result<&Arc<dyn RecordStore>> {
        let reason = match (&self.store, owner_id.trim().is_empty()) {
            (Some(store), false) => return Ok(store),
            (None, _) => "backend not configured",
            (Some(_), true) => "owner id missing",
        };
        if cfg!(debug_assertions) && !self.warned_unconfigured.swap(true, Ordering::Relaxed) {
            warn!("[CloudSync] Sync disabled ({}); operating locally", reason);
        }
        Err(CloudSyncError::not_configured(reason))
    }

    /// Upserts the single record for `(owner_id, payload.data_type())`,
    /// tagged with this device's id.
    pub async fn save(&self, owner_id: &str, payload: &SyncPayload) -> Result<()> {
        let store = self.backend(owner_id)?;
        let record = SyncRecord {
            owner_id: owner_id.to_string(),
            payload: payload.clone(),
            device_id: self.identity.device_id().to_string(),
            updated_at: Utc::now().to_rfc3339(),
        };
        let row = SyncRecordRow::from_record(&record)?;

        match store.upsert_record(&row).await {
            Ok(()) => {
                debug!("[CloudSync] Saved {} for {}", record.data_type(), owner_id);
                Ok(())
            }
            Err(e) => {
                log!(
                    write_failure_level(&e),
                    "[CloudSync] Failed to save {} for {}: {}",
                    record.data_type(),
                    owner_id,
                    e
                );
                Err(e)
            }
        }
    }

    /// Full record including the writer's device id. `Ok(None)` when the
    /// backend has no row yet.
    pub async fn load_record(
        &self,
        owner_id: &str,
        data_type: SyncDataType,
    ) -> Result<Option<SyncRecord>> {
        let store = self.backend(owner_id)?;
        let row = match store.fetch_record(owner_id, data_type).await {
            Ok(row) => row,
            Err(e) => {
                warn!(
                    "[CloudSync] Failed to load {} for {}: {}",
                    data_type, owner_id, e
                );
                return Err(e);
            }
        };
        row.map(SyncRecordRow::into_record)
            .transpose()
            .inspect_err(|e| warn!("[CloudSync] Discarding stored {}: {}", data_type, e))
    }

    pub async fn load(
        &self,
        owner_id: &str,
        data_type: SyncDataType,
    ) -> Result<Option<SyncPayload>> {
        Ok(self
            .load_record(owner_id, data_type)
            .await?
            .map(|record| record.payload))
    }

    /// Every data type with remote state. Types that fail to load are
    /// skipped; only a missing configuration fails the whole call.
    pub async fn load_all(&self, owner_id: &str) -> Result<BTreeMap<SyncDataType, SyncPayload>> {
        self.backend(owner_id)?;

        let results = join_all(
            SyncDataType::ALL
                .into_iter()
                .map(|data_type| async move { (data_type, self.load(owner_id, data_type).await) }),
        )
        .await;

        let mut loaded = BTreeMap::new();
        for (data_type, result) in results {
            match result {
                Ok(Some(payload)) => {
                    loaded.insert(data_type, payload);
                }
                Ok(None) => {}
                Err(e) => debug!("[CloudSync] Skipping {} in load_all: {}", data_type, e),
            }
        }
        Ok(loaded)
    }

    /// Upserts the populated fields of `patch`. Absent fields keep their
    /// remote value; a present `ui_flags` map replaces the stored one.
    pub async fn save_preferences(&self, owner_id: &str, patch: &PreferencesPatch) -> Result<()> {
        let store = self.backend(owner_id)?;
        if patch.is_empty() {
            return Err(CloudSyncError::invalid_request("empty preferences patch"));
        }
        let row = PreferencesRow::from_patch(
            owner_id,
            patch,
            self.identity.device_id(),
            &Utc::now().to_rfc3339(),
        );
        store.upsert_preferences(&row).await.inspect_err(|e| {
            log!(
                write_failure_level(e),
                "[CloudSync] Failed to save preferences for {}: {}",
                owner_id,
                e
            )
        })
    }

    pub async fn load_preferences(&self, owner_id: &str) -> Result<Option<PreferenceRecord>> {
        Ok(self
            .fetch_preferences(owner_id)
            .await?
            .map(PreferencesRow::into_record))
    }

    /// Only the preference columns the backend actually holds, for merging
    /// into local preferences without resetting the rest.
    pub async fn load_preferences_patch(
        &self,
        owner_id: &str,
    ) -> Result<Option<PreferencesPatch>> {
        Ok(self
            .fetch_preferences(owner_id)
            .await?
            .map(|row| row.patch()))
    }

    async fn fetch_preferences(&self, owner_id: &str) -> Result<Option<PreferencesRow>> {
        let store = self.backend(owner_id)?;
        store.fetch_preferences(owner_id).await.inspect_err(|e| {
            warn!("[CloudSync] Failed to load preferences for {}: {}", owner_id, e)
        })
    }
}

impl std::fmt::Debug for CloudPersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudPersistenceGateway")
            .field("enabled", &self.is_enabled())
            .field("identity", &self.identity)
            .finish()
    }
}
