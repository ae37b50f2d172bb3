//! Record store contract the gateway writes through.

use async_trait::async_trait;
use workspace_sync_core::sync::SyncDataType;

use crate::error::Result;
use crate::types::{PreferencesRow, SyncRecordRow};

/// Keyed upsert/select access to the backend tables.
///
/// Implementations must give upsert semantics: one row per
/// `(user_id, data_type)` for records and one row per `user_id` for
/// preferences, with later writes replacing earlier ones.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_record(&self, row: &SyncRecordRow) -> Result<()>;

    /// `Ok(None)` when no row exists yet.
    async fn fetch_record(
        &self,
        owner_id: &str,
        data_type: SyncDataType,
    ) -> Result<Option<SyncRecordRow>>;

    /// Upserts only the populated columns of `row`.
    async fn upsert_preferences(&self, row: &PreferencesRow) -> Result<()>;

    async fn fetch_preferences(&self, owner_id: &str) -> Result<Option<PreferencesRow>>;
}
