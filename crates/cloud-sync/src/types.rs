//! Wire rows exchanged with the sync backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use workspace_sync_core::sync::{
    LayoutMode, PreferenceRecord, PreferencesPatch, StartupBehavior, SyncDataType, SyncPayload,
    SyncRecord, TabOpenBehavior,
};

use crate::error::{CloudSyncError, Result};

/// Column holding the owner id on both tables.
pub const OWNER_COLUMN: &str = "user_id";
/// Column holding the record kind on the records table.
pub const DATA_TYPE_COLUMN: &str = "data_type";

/// Row of the records table. Unique on `(user_id, data_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecordRow {
    pub user_id: String,
    pub data_type: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl SyncRecordRow {
    pub fn from_record(record: &SyncRecord) -> Result<Self> {
        Ok(Self {
            user_id: record.owner_id.clone(),
            data_type: record.data_type().as_str().to_string(),
            data: record.payload.to_value()?,
            device_id: Some(record.device_id.clone()),
            updated_at: Some(record.updated_at.clone()),
        })
    }

    pub fn data_type(&self) -> Result<SyncDataType> {
        SyncDataType::parse(&self.data_type).ok_or_else(|| {
            CloudSyncError::malformed(format!("unknown data_type '{}'", self.data_type))
        })
    }

    /// Decodes the row into a typed record, validating `data` on the way.
    pub fn into_record(self) -> Result<SyncRecord> {
        let data_type = self.data_type()?;
        let payload = SyncPayload::decode(data_type, self.data).map_err(|e| {
            CloudSyncError::malformed(format!("{} payload for {}: {}", data_type, self.user_id, e))
        })?;
        Ok(SyncRecord {
            owner_id: self.user_id,
            payload,
            device_id: self.device_id.unwrap_or_default(),
            updated_at: self.updated_at.unwrap_or_default(),
        })
    }
}

/// Row of the preferences table. Unique on `user_id`.
///
/// Only the populated columns are sent on upsert so a partial update never
/// resets columns it does not mention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferencesRow {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_mode: Option<LayoutMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_open_behavior: Option<TabOpenBehavior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_behavior: Option<StartupBehavior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_flags: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl PreferencesRow {
    pub fn from_patch(
        owner_id: &str,
        patch: &PreferencesPatch,
        device_id: &str,
        updated_at: &str,
    ) -> Self {
        Self {
            user_id: owner_id.to_string(),
            layout_mode: patch.layout_mode,
            tab_open_behavior: patch.tab_open_behavior,
            startup_behavior: patch.startup_behavior,
            ui_flags: patch.ui_flags.clone(),
            device_id: Some(device_id.to_string()),
            updated_at: Some(updated_at.to_string()),
        }
    }

    pub fn patch(&self) -> PreferencesPatch {
        PreferencesPatch {
            layout_mode: self.layout_mode,
            tab_open_behavior: self.tab_open_behavior,
            startup_behavior: self.startup_behavior,
            ui_flags: self.ui_flags.clone(),
        }
    }

    pub fn into_record(self) -> PreferenceRecord {
        let mut record = PreferenceRecord::new(self.user_id.clone());
        record.apply_patch(&self.patch());
        record.device_id = self.device_id;
        record.updated_at = self.updated_at;
        record
    }
}

/// Error body returned by the REST backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}
