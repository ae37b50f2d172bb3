//! Folds remote change notifications into local state.

use log::{debug, warn};
use std::sync::Arc;
use workspace_sync_core::sync::{DeviceIdentity, SyncDataType, WorkspaceStateSink};

use crate::realtime::{ChangeCallback, ChangeKind, RowChange};
use crate::types::{PreferencesRow, SyncRecordRow};

/// What happened to one change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied(SyncDataType),
    PreferencesMerged,
    /// Written by this device; dropped.
    EchoSuppressed,
    /// Deletes, other owners, other tables.
    Ignored,
    /// Row failed to decode; nothing was applied.
    Malformed,
}

pub struct ChangeNotificationRouter {
    identity: Arc<DeviceIdentity>,
    sink: Arc<dyn WorkspaceStateSink>,
    owner_id: String,
    records_table: String,
    preferences_table: String,
}

impl ChangeNotificationRouter {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        sink: Arc<dyn WorkspaceStateSink>,
        owner_id: impl Into<String>,
        records_table: impl Into<String>,
        preferences_table: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            sink,
            owner_id: owner_id.into(),
            records_table: records_table.into(),
            preferences_table: preferences_table.into(),
        }
    }

    pub fn on_remote_change(&self, change: &RowChange) -> RouteOutcome {
        // Rows are current state, never removed in normal operation.
        if change.kind == ChangeKind::Delete {
            return RouteOutcome::Ignored;
        }
        let Some(row) = change.new.as_ref() else {
            return RouteOutcome::Ignored;
        };

        if let Some(device_id) = row.get("device_id").and_then(|v| v.as_str()) {
            if self.identity.is_local(device_id) {
                debug!("[SyncRouter] Dropping echo on {}", change.table);
                return RouteOutcome::EchoSuppressed;
            }
        }

        if change.table == self.records_table {
            self.apply_record(row)
        } else if change.table == self.preferences_table {
            self.apply_preferences(row)
        } else {
            RouteOutcome::Ignored
        }
    }

    fn apply_record(&self, row: &serde_json::Value) -> RouteOutcome {
        let row: SyncRecordRow = match serde_json::from_value(row.clone()) {
            Ok(row) => row,
            Err(e) => {
                warn!("[SyncRouter] Dropping undecodable record row: {}", e);
                return RouteOutcome::Malformed;
            }
        };
        if row.user_id != self.owner_id {
            return RouteOutcome::Ignored;
        }
        match row.into_record() {
            Ok(record) => {
                let data_type = record.data_type();
                debug!(
                    "[SyncRouter] Applying remote {} from {}",
                    data_type, record.device_id
                );
                self.sink.replace(record.payload);
                RouteOutcome::Applied(data_type)
            }
            Err(e) => {
                warn!("[SyncRouter] Dropping remote record: {}", e);
                RouteOutcome::Malformed
            }
        }
    }

    fn apply_preferences(&self, row: &serde_json::Value) -> RouteOutcome {
        let row: PreferencesRow = match serde_json::from_value(row.clone()) {
            Ok(row) => row,
            Err(e) => {
                warn!("[SyncRouter] Dropping undecodable preferences row: {}", e);
                return RouteOutcome::Malformed;
            }
        };
        if row.user_id != self.owner_id {
            return RouteOutcome::Ignored;
        }
        // Sparse rows carry only the columns that were written.
        self.sink.merge_preferences(&row.user_id, &row.patch());
        RouteOutcome::PreferencesMerged
    }

    /// Subscription callback that routes every change through `self`.
    pub fn into_callback(self: Arc<Self>) -> ChangeCallback {
        Arc::new(move |change: RowChange| {
            self.on_remote_change(&change);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use workspace_sync_core::local_store::MemoryLocalStore;
    use workspace_sync_core::sync::{LayoutMode, StartupBehavior, WorkspaceStore};

    fn router() -> (ChangeNotificationRouter, Arc<WorkspaceStore>, Arc<DeviceIdentity>) {
        let identity = Arc::new(DeviceIdentity::new(Arc::new(MemoryLocalStore::new())));
        let store = Arc::new(WorkspaceStore::new());
        let router = ChangeNotificationRouter::new(
            Arc::clone(&identity),
            store.clone(),
            "owner-1",
            "workspace_sync",
            "user_preferences",
        );
        (router, store, identity)
    }

    fn change(table: &str, row: serde_json::Value) -> RowChange {
        RowChange {
            table: table.to_string(),
            kind: ChangeKind::Update,
            new: Some(row),
            old: None,
            commit_timestamp: None,
        }
    }

    #[test]
    fn remote_tabs_replace_local_tabs() {
        let (router, store, _) = router();
        let outcome = router.on_remote_change(&change(
            "workspace_sync",
            json!({
                "user_id": "owner-1",
                "data_type": "tabs",
                "data": [{ "id": "t1", "title": "Board" }],
                "device_id": "device-other"
            }),
        ));

        assert_eq!(outcome, RouteOutcome::Applied(SyncDataType::Tabs));
        let tabs = store.tabs();
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].id, "t1");
    }

    #[test]
    fn own_device_events_never_reach_the_store() {
        let (router, store, identity) = router();
        let own = identity.device_id().to_string();

        for (table, data_type, data) in [
            ("workspace_sync", "tabs", json!([{ "id": "t1" }])),
            ("workspace_sync", "layout", json!({ "mode": "split" })),
            ("workspace_sync", "expanded_items", json!({ "sidebar": ["a"] })),
            ("workspace_sync", "tabs", json!("garbage")),
            ("user_preferences", "", json!(null)),
        ] {
            let row = json!({
                "user_id": "owner-1",
                "data_type": data_type,
                "data": data,
                "layout_mode": "grid",
                "device_id": own,
            });
            assert_eq!(
                router.on_remote_change(&change(table, row)),
                RouteOutcome::EchoSuppressed
            );
        }
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn malformed_payload_is_dropped_without_partial_apply() {
        let (router, store, _) = router();
        let outcome = router.on_remote_change(&change(
            "workspace_sync",
            json!({
                "user_id": "owner-1",
                "data_type": "layout",
                "data": { "mode": 42 },
                "device_id": "device-other"
            }),
        ));
        assert_eq!(outcome, RouteOutcome::Malformed);

        let outcome = router.on_remote_change(&change("workspace_sync", json!({ "nope": true })));
        assert_eq!(outcome, RouteOutcome::Malformed);
        assert_eq!(store.snapshot().layout, None);
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn preferences_merge_by_field() {
        let (router, store, _) = router();
        store.patch_preferences(
            "owner-1",
            &workspace_sync_core::sync::PreferencesPatch {
                ui_flags: Some([("minimap".to_string(), true)].into()),
                ..Default::default()
            },
        );

        let outcome = router.on_remote_change(&change(
            "user_preferences",
            json!({
                "user_id": "owner-1",
                "layout_mode": "split",
                "ui_flags": { "rulers": true },
                "device_id": "device-other"
            }),
        ));

        assert_eq!(outcome, RouteOutcome::PreferencesMerged);
        let prefs = store.preferences().expect("preferences");
        assert_eq!(prefs.layout_mode, LayoutMode::Split);
        assert_eq!(prefs.ui_flags.get("minimap"), Some(&true));
        assert_eq!(prefs.ui_flags.get("rulers"), Some(&true));
    }

    #[test]
    fn sparse_preferences_row_leaves_other_fields_alone() {
        let (router, store, _) = router();
        store.patch_preferences(
            "owner-1",
            &workspace_sync_core::sync::PreferencesPatch {
                layout_mode: Some(LayoutMode::Grid),
                ..Default::default()
            },
        );

        let outcome = router.on_remote_change(&change(
            "user_preferences",
            json!({
                "user_id": "owner-1",
                "startup_behavior": "dashboard",
                "device_id": "device-other"
            }),
        ));

        assert_eq!(outcome, RouteOutcome::PreferencesMerged);
        let prefs = store.preferences().expect("preferences");
        assert_eq!(prefs.layout_mode, LayoutMode::Grid);
        assert_eq!(prefs.startup_behavior, StartupBehavior::Dashboard);
    }

    #[test]
    fn other_owners_deletes_and_tables_are_ignored() {
        let (router, _, _) = router();
        let foreign = json!({
            "user_id": "owner-2",
            "data_type": "tabs",
            "data": [],
            "device_id": "device-other"
        });
        assert_eq!(
            router.on_remote_change(&change("workspace_sync", foreign.clone())),
            RouteOutcome::Ignored
        );
        assert_eq!(
            router.on_remote_change(&change("calendar_events", foreign.clone())),
            RouteOutcome::Ignored
        );

        let delete = RowChange {
            kind: ChangeKind::Delete,
            new: None,
            old: Some(foreign),
            ..change("workspace_sync", json!({}))
        };
        assert_eq!(router.on_remote_change(&delete), RouteOutcome::Ignored);
    }
}
