use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ephemeral per-client presence data. Never persisted; cleared on disconnect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    pub user_id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub selected_page_id: Option<String>,
    #[serde(default)]
    pub editing_component_id: Option<String>,
}

/// One entry in the document's lock map (componentId -> LockInfo).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub holder_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Dirty/save tracking for one document session.
#[derive(Debug, Clone, Default)]
pub struct DirtyState {
    pub is_dirty: bool,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub save_in_progress: bool,
}
