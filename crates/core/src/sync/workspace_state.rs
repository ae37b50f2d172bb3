//! In-memory workspace state that local mutations and remote changes fold into.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::workspace_sync_model::{
    ExpandedItems, LayoutState, PreferenceRecord, PreferencesPatch, SyncPayload, TabState,
    WorkspaceSettings,
};

/// Receiver for state changes coming from the sync engine.
///
/// Record payloads replace the local value wholesale; preferences merge field
/// by field, so columns absent from `remote` keep their local value.
pub trait WorkspaceStateSink: Send + Sync {
    fn replace(&self, payload: SyncPayload);
    fn merge_preferences(&self, owner_id: &str, remote: &PreferencesPatch);
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceSnapshot {
    pub tabs: Vec<TabState>,
    pub layout: Option<LayoutState>,
    pub settings: Option<WorkspaceSettings>,
    pub expanded_items: ExpandedItems,
    pub preferences: Option<PreferenceRecord>,
    /// Bumped on every applied change.
    pub revision: u64,
}

/// Default [`WorkspaceStateSink`]: a lock-protected snapshot.
#[derive(Debug, Default)]
pub struct WorkspaceStore {
    state: RwLock<WorkspaceSnapshot>,
}

impl WorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> WorkspaceSnapshot {
        self.read().clone()
    }

    pub fn tabs(&self) -> Vec<TabState> {
        self.read().tabs.clone()
    }

    pub fn expanded_items(&self) -> ExpandedItems {
        self.read().expanded_items.clone()
    }

    pub fn preferences(&self) -> Option<PreferenceRecord> {
        self.read().preferences.clone()
    }

    pub fn revision(&self) -> u64 {
        self.read().revision
    }

    /// Applies a local preference edit on top of the current preferences.
    pub fn patch_preferences(&self, owner_id: &str, patch: &PreferencesPatch) {
        let mut state = self.write();
        state
            .preferences
            .get_or_insert_with(|| PreferenceRecord::new(owner_id))
            .apply_patch(patch);
        state.revision += 1;
    }

    // A panicking writer cannot leave the snapshot half-updated (every
    // mutation is a single assignment), so poisoned locks are recovered.
    fn read(&self) -> RwLockReadGuard<'_, WorkspaceSnapshot> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, WorkspaceSnapshot> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl WorkspaceStateSink for WorkspaceStore {
    fn replace(&self, payload: SyncPayload) {
        let mut state = self.write();
        match payload {
            SyncPayload::Tabs(tabs) => state.tabs = tabs,
            SyncPayload::Layout(layout) => state.layout = Some(layout),
            SyncPayload::Settings(settings) => state.settings = Some(settings),
            SyncPayload::ExpandedItems(items) => state.expanded_items = items,
        }
        state.revision += 1;
    }

    fn merge_preferences(&self, owner_id: &str, remote: &PreferencesPatch) {
        self.patch_preferences(owner_id, remote);
    }
}
