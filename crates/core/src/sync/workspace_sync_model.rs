//! Workspace sync domain models.
//!
//! Consistency model: last-writer-wins. There is exactly one live record per
//! `(owner_id, data_type)` and the last upsert to arrive at the backend
//! replaces it in full. Concurrent edits from two tabs or devices are not
//! merged; the later arrival clobbers the earlier one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kinds of workspace state that are synchronized per owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDataType {
    Tabs,
    Layout,
    Settings,
    ExpandedItems,
}

impl SyncDataType {
    pub const ALL: [SyncDataType; 4] = [
        SyncDataType::Tabs,
        SyncDataType::Layout,
        SyncDataType::Settings,
        SyncDataType::ExpandedItems,
    ];

    /// Wire name used in the `data_type` column and in filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDataType::Tabs => "tabs",
            SyncDataType::Layout => "layout",
            SyncDataType::Settings => "settings",
            SyncDataType::ExpandedItems => "expanded_items",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl std::fmt::Display for SyncDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One open tab in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabState {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Content kind rendered in the tab (canvas, document, chat, ...).
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    #[default]
    Single,
    Split,
    Grid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaneState {
    pub id: String,
    #[serde(default)]
    pub tab_ids: Vec<String>,
    /// Fraction of the available space, `None` for auto sizing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutState {
    #[serde(default)]
    pub mode: LayoutMode,
    #[serde(default)]
    pub panes: Vec<PaneState>,
    #[serde(default)]
    pub sidebar_collapsed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidebar_width: Option<u32>,
}

/// Canvas and editor settings. Unknown keys are preserved so newer clients
/// do not lose data written by each other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default)]
    pub grid_enabled: bool,
    #[serde(default)]
    pub snap_to_grid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Expanded node ids per tree (sidebar trees, outline panels, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpandedItems(pub BTreeMap<String, BTreeSet<String>>);

impl ExpandedItems {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_expanded(&self, tree: &str, item: &str) -> bool {
        self.0.get(tree).is_some_and(|items| items.contains(item))
    }
}

/// Typed payload of a sync record, one schema per [`SyncDataType`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPayload {
    Tabs(Vec<TabState>),
    Layout(LayoutState),
    Settings(WorkspaceSettings),
    ExpandedItems(ExpandedItems),
}

impl SyncPayload {
    pub fn data_type(&self) -> SyncDataType {
        match self {
            SyncPayload::Tabs(_) => SyncDataType::Tabs,
            SyncPayload::Layout(_) => SyncDataType::Layout,
            SyncPayload::Settings(_) => SyncDataType::Settings,
            SyncPayload::ExpandedItems(_) => SyncDataType::ExpandedItems,
        }
    }

    /// Validates an untyped `data` column against the schema of `data_type`.
    pub fn decode(
        data_type: SyncDataType,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match data_type {
            SyncDataType::Tabs => SyncPayload::Tabs(serde_json::from_value(value)?),
            SyncDataType::Layout => SyncPayload::Layout(serde_json::from_value(value)?),
            SyncDataType::Settings => SyncPayload::Settings(serde_json::from_value(value)?),
            SyncDataType::ExpandedItems => {
                SyncPayload::ExpandedItems(serde_json::from_value(value)?)
            }
        })
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            SyncPayload::Tabs(tabs) => serde_json::to_value(tabs),
            SyncPayload::Layout(layout) => serde_json::to_value(layout),
            SyncPayload::Settings(settings) => serde_json::to_value(settings),
            SyncPayload::ExpandedItems(items) => serde_json::to_value(items),
        }
    }
}

/// The single live record for one `(owner_id, data_type)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub owner_id: String,
    pub payload: SyncPayload,
    pub device_id: String,
    pub updated_at: String,
}

impl SyncRecord {
    pub fn data_type(&self) -> SyncDataType {
        self.payload.data_type()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabOpenBehavior {
    #[default]
    NewTab,
    ReplaceCurrent,
    Background,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupBehavior {
    #[default]
    RestoreSession,
    NewWorkspace,
    Dashboard,
}

/// Per-owner scalar preferences plus a bag of UI toggle flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceRecord {
    pub owner_id: String,
    #[serde(default)]
    pub layout_mode: LayoutMode,
    #[serde(default)]
    pub tab_open_behavior: TabOpenBehavior,
    #[serde(default)]
    pub startup_behavior: StartupBehavior,
    #[serde(default)]
    pub ui_flags: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl PreferenceRecord {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Self::default()
        }
    }

    /// Applies the fields present in `patch`; UI flags merge per flag.
    pub fn apply_patch(&mut self, patch: &PreferencesPatch) {
        if let Some(mode) = patch.layout_mode {
            self.layout_mode = mode;
        }
        if let Some(behavior) = patch.tab_open_behavior {
            self.tab_open_behavior = behavior;
        }
        if let Some(behavior) = patch.startup_behavior {
            self.startup_behavior = behavior;
        }
        if let Some(flags) = &patch.ui_flags {
            self.ui_flags
                .extend(flags.iter().map(|(k, v)| (k.clone(), *v)));
        }
    }
}

/// Partial preference update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_mode: Option<LayoutMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_open_behavior: Option<TabOpenBehavior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_behavior: Option<StartupBehavior>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_flags: Option<BTreeMap<String, bool>>,
}

impl PreferencesPatch {
    pub fn is_empty(&self) -> bool {
        self.layout_mode.is_none()
            && self.tab_open_behavior.is_none()
            && self.startup_behavior.is_none()
            && self.ui_flags.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_type_serialization_matches_backend_contract() {
        let actual = SyncDataType::ALL
            .iter()
            .map(|t| serde_json::to_string(t).expect("serialize data type"))
            .collect::<Vec<_>>();
        assert_eq!(
            actual,
            vec!["\"tabs\"", "\"layout\"", "\"settings\"", "\"expanded_items\""]
        );
        for t in SyncDataType::ALL {
            assert_eq!(SyncDataType::parse(t.as_str()), Some(t));
        }
        assert_eq!(SyncDataType::parse("orders"), None);
    }

    #[test]
    fn decode_validates_against_variant_schema() {
        let tabs = SyncPayload::decode(
            SyncDataType::Tabs,
            json!([{ "id": "t1", "title": "Board", "kind": "canvas", "active": true }]),
        )
        .expect("tabs decode");
        match tabs {
            SyncPayload::Tabs(tabs) => {
                assert_eq!(tabs.len(), 1);
                assert_eq!(tabs[0].id, "t1");
                assert!(tabs[0].active);
                assert!(!tabs[0].pinned);
            }
            other => panic!("expected tabs, got {:?}", other),
        }

        assert!(SyncPayload::decode(SyncDataType::Tabs, json!({ "id": "t1" })).is_err());
        assert!(SyncPayload::decode(SyncDataType::ExpandedItems, json!(["a"])).is_err());
    }

    #[test]
    fn settings_keep_unknown_keys() {
        let payload = SyncPayload::decode(
            SyncDataType::Settings,
            json!({ "theme": "dark", "gridEnabled": true, "minimapVisible": false }),
        )
        .expect("settings decode");
        let value = payload.to_value().expect("encode");
        assert_eq!(value["theme"], "dark");
        assert_eq!(value["gridEnabled"], true);
        assert_eq!(value["minimapVisible"], false);
    }

    #[test]
    fn expanded_items_are_a_plain_map() {
        let payload = SyncPayload::decode(
            SyncDataType::ExpandedItems,
            json!({ "sidebar": ["folder-1", "folder-2"] }),
        )
        .expect("expanded decode");
        match payload {
            SyncPayload::ExpandedItems(items) => {
                assert!(items.is_expanded("sidebar", "folder-2"));
                assert!(!items.is_expanded("outline", "folder-2"));
            }
            other => panic!("expected expanded items, got {:?}", other),
        }
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let mut prefs = PreferenceRecord::new("owner-1");
        prefs.ui_flags.insert("showMinimap".into(), true);
        prefs.apply_patch(&PreferencesPatch {
            layout_mode: Some(LayoutMode::Split),
            ui_flags: Some(BTreeMap::from([("compactTabs".to_string(), true)])),
            ..PreferencesPatch::default()
        });

        assert_eq!(prefs.layout_mode, LayoutMode::Split);
        assert_eq!(prefs.startup_behavior, StartupBehavior::RestoreSession);
        assert_eq!(prefs.ui_flags.get("showMinimap"), Some(&true));
        assert_eq!(prefs.ui_flags.get("compactTabs"), Some(&true));
    }
}
