//! One-time upload of the legacy local-only workspace blob.
//!
//! The per-owner completion flag lives in the device-local store, so each
//! device migrates at most once per owner. The flag is set even when some
//! writes fail: a partially migrated owner is not retried on later startups.

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use workspace_sync_core::local_store::LocalStore;
use workspace_sync_core::sync::{
    ExpandedItems, LayoutState, PreferencesPatch, SyncPayload, TabState, WorkspaceSettings,
};

use crate::error::Result;
use crate::gateway::CloudPersistenceGateway;

/// Local store key of the legacy persisted workspace state.
pub const LEGACY_STATE_KEY: &str = "workspace-storage";

const MIGRATION_FLAG_PREFIX: &str = "workspace_sync.migrated.";
const MIGRATED: &str = "true";

pub fn migration_flag_key(owner_id: &str) -> String {
    format!("{}{}", MIGRATION_FLAG_PREFIX, owner_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Flag already set on this device.
    AlreadyMigrated,
    /// No usable legacy state; the flag is now set.
    NothingToMigrate,
    /// Sync disabled or no owner; the flag stays unset.
    Skipped,
    Migrated { written: usize, failed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub owner_id: String,
    pub outcome: MigrationOutcome,
}

/// Legacy state, each field decoded independently so one bad field does not
/// discard the rest.
#[derive(Debug, Default, PartialEq)]
struct LegacyWorkspace {
    tabs: Option<Vec<TabState>>,
    expanded_items: Option<ExpandedItems>,
    layout: Option<LayoutState>,
    settings: Option<WorkspaceSettings>,
    preferences: Option<PreferencesPatch>,
}

impl LegacyWorkspace {
    fn payloads(&self) -> Vec<SyncPayload> {
        let mut payloads = Vec::new();
        if let Some(tabs) = self.tabs.as_ref().filter(|tabs| !tabs.is_empty()) {
            payloads.push(SyncPayload::Tabs(tabs.clone()));
        }
        if let Some(items) = self.expanded_items.as_ref().filter(|items| !items.is_empty()) {
            payloads.push(SyncPayload::ExpandedItems(items.clone()));
        }
        if let Some(layout) = &self.layout {
            payloads.push(SyncPayload::Layout(layout.clone()));
        }
        if let Some(settings) = &self.settings {
            payloads.push(SyncPayload::Settings(settings.clone()));
        }
        payloads
    }

    fn preferences(&self) -> Option<&PreferencesPatch> {
        self.preferences.as_ref().filter(|patch| !patch.is_empty())
    }
}

/// Accepts the persisted envelope `{"state": {...}, "version": n}` or a bare
/// state object.
fn parse_legacy_blob(raw: &str) -> std::result::Result<LegacyWorkspace, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let state = match value.get("state") {
        Some(state) if state.is_object() => state,
        _ => &value,
    };
    if !state.is_object() {
        return Err(<serde_json::Error as serde::de::Error>::custom(
            "legacy state is not an object",
        ));
    }

    Ok(LegacyWorkspace {
        tabs: legacy_field(state, "tabs"),
        expanded_items: state.get("expandedItems").and_then(legacy_expanded_items),
        layout: legacy_field(state, "layout"),
        settings: legacy_field(state, "settings"),
        preferences: legacy_field(state, "preferences"),
    })
}

fn legacy_field<T: DeserializeOwned>(state: &serde_json::Value, name: &str) -> Option<T> {
    let value = state.get(name).filter(|v| !v.is_null())?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("[Migration] Ignoring legacy field {}: {}", name, e);
            None
        }
    }
}

/// Older builds stored `{tree: {id: bool}}` instead of `{tree: [id, ..]}`.
fn legacy_expanded_items(value: &serde_json::Value) -> Option<ExpandedItems> {
    if value.is_null() {
        return None;
    }
    if let Ok(items) = serde_json::from_value::<ExpandedItems>(value.clone()) {
        return Some(items);
    }
    match serde_json::from_value::<BTreeMap<String, BTreeMap<String, bool>>>(value.clone()) {
        Ok(trees) => Some(ExpandedItems(
            trees
                .into_iter()
                .map(|(tree, items)| {
                    let expanded: BTreeSet<String> = items
                        .into_iter()
                        .filter_map(|(id, open)| open.then_some(id))
                        .collect();
                    (tree, expanded)
                })
                .filter(|(_, expanded)| !expanded.is_empty())
                .collect(),
        )),
        Err(e) => {
            warn!("[Migration] Ignoring legacy field expandedItems: {}", e);
            None
        }
    }
}

pub struct LocalToCloudMigrator {
    local: Arc<dyn LocalStore>,
    gateway: Arc<CloudPersistenceGateway>,
}

impl LocalToCloudMigrator {
    pub fn new(local: Arc<dyn LocalStore>, gateway: Arc<CloudPersistenceGateway>) -> Self {
        Self { local, gateway }
    }

    pub fn is_migrated(&self, owner_id: &str) -> Result<bool> {
        Ok(self.local.get(&migration_flag_key(owner_id))?.as_deref() == Some(MIGRATED))
    }

    /// Uploads the legacy blob for `owner_id` unless this device already did.
    ///
    /// Only local storage failures are returned as errors; failed remote
    /// writes are counted in the report.
    pub async fn migrate_once(&self, owner_id: &str) -> Result<MigrationReport> {
        let report = |outcome| MigrationReport {
            owner_id: owner_id.to_string(),
            outcome,
        };

        if !self.gateway.is_enabled() || owner_id.trim().is_empty() {
            debug!("[Migration] Sync disabled, skipping migration");
            return Ok(report(MigrationOutcome::Skipped));
        }
        if self.is_migrated(owner_id)? {
            return Ok(report(MigrationOutcome::AlreadyMigrated));
        }

        let legacy = match self.local.get(LEGACY_STATE_KEY)? {
            Some(raw) if !raw.trim().is_empty() => match parse_legacy_blob(&raw) {
                Ok(legacy) => legacy,
                Err(e) => {
                    warn!("[Migration] Legacy state for {} is unreadable: {}", owner_id, e);
                    LegacyWorkspace::default()
                }
            },
            _ => LegacyWorkspace::default(),
        };

        let payloads = legacy.payloads();
        let preferences = legacy.preferences();
        if payloads.is_empty() && preferences.is_none() {
            self.mark_migrated(owner_id)?;
            return Ok(report(MigrationOutcome::NothingToMigrate));
        }

        let mut written = 0;
        let mut failed = 0;
        for payload in &payloads {
            match self.gateway.save(owner_id, payload).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!("[Migration] Failed to migrate {}: {}", payload.data_type(), e);
                    failed += 1;
                }
            }
        }
        if let Some(patch) = preferences {
            match self.gateway.save_preferences(owner_id, patch).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!("[Migration] Failed to migrate preferences: {}", e);
                    failed += 1;
                }
            }
        }

        self.mark_migrated(owner_id)?;
        info!(
            "[Migration] Migrated legacy state for {}: {} written, {} failed",
            owner_id, written, failed
        );
        Ok(report(MigrationOutcome::Migrated { written, failed }))
    }

    fn mark_migrated(&self, owner_id: &str) -> Result<()> {
        self.local.set(&migration_flag_key(owner_id), MIGRATED)?;
        Ok(())
    }
}
