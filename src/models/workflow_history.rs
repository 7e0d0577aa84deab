use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Lifecycle event recorded against a workflow version.
///
/// Any recorded event means the version was live at some point, which
/// protects it from compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationEvent {
    /// The version was published and made active.
    Activated,
    /// The version was active and has since been deactivated.
    Deactivated,
}

impl std::fmt::Display for ActivationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivationEvent::Activated => write!(f, "activated"),
            ActivationEvent::Deactivated => write!(f, "deactivated"),
        }
    }
}

impl std::str::FromStr for ActivationEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activated" => Ok(ActivationEvent::Activated),
            "deactivated" => Ok(ActivationEvent::Deactivated),
            _ => Err(format!("Invalid activation event: {}", s)),
        }
    }
}

/// A single historical snapshot of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHistory {
    /// Store-assigned key, increasing in insertion order
    pub id: i64,
    /// Logical version identifier
    pub version_id: Uuid,
    /// Workflow this version belongs to
    pub workflow_id: String,
    /// Who produced this version
    pub authors: String,
    /// Node definitions at this version
    pub nodes: JsonValue,
    /// Node connections at this version
    pub connections: JsonValue,
    /// User-assigned label; a named version is never compacted
    pub name: Option<String>,
    /// Activation marker; an activated version is never compacted
    pub activation_event: Option<ActivationEvent>,
    /// When the version was saved
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowHistory {
    /// Whether compaction must keep this version regardless of its age.
    pub fn is_protected(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty()) || self.activation_event.is_some()
    }
}

/// Input for recording a new workflow version
#[derive(Debug, Clone)]
pub struct CreateWorkflowHistory {
    pub workflow_id: String,
    /// Defaults to a random UUID
    pub version_id: Option<Uuid>,
    pub authors: String,
    pub nodes: JsonValue,
    pub connections: JsonValue,
    pub name: Option<String>,
    pub activation_event: Option<ActivationEvent>,
    /// Defaults to now. Set explicitly when importing existing history.
    pub created_at: Option<DateTime<Utc>>,
}

impl CreateWorkflowHistory {
    /// An auto-saved, unnamed and never activated version.
    pub fn autosave(workflow_id: impl Into<String>, nodes: JsonValue) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version_id: None,
            authors: String::new(),
            nodes,
            connections: JsonValue::Object(Default::default()),
            name: None,
            activation_event: None,
            created_at: None,
        }
    }
}

/// Outcome of compacting one workflow's history within a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneResult {
    /// Versions found in the window before deletion
    pub seen: u64,
    /// Versions removed (or that would be removed, for a preview)
    pub deleted: u64,
}

impl PruneResult {
    /// Versions left in the window afterwards.
    pub fn retained(&self) -> u64 {
        self.seen.saturating_sub(self.deleted)
    }
}
