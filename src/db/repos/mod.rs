mod workflow_history;

use chrono::{DateTime, Utc};
pub use workflow_history::*;

use crate::{
    db::error::{DbError, DbResult},
    models::{ActivationEvent, CreateWorkflowHistory},
};

/// Longest workflow ID accepted by the store.
pub const MAX_WORKFLOW_ID_LEN: usize = 64;

/// Longest version name accepted by the store.
pub const MAX_NAME_LEN: usize = 128;

/// Sort order for list queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending order (oldest first)
    #[default]
    Asc,
    /// Descending order (newest first)
    Desc,
}

impl SortOrder {
    /// Get the SQL ORDER BY direction string.
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Truncate a timestamp to millisecond precision.
///
/// Both backends store history timestamps at millisecond precision so that
/// window bounds compare identically on SQLite (text) and PostgreSQL.
pub fn truncate_to_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}

/// Empty names carry no meaning and are stored as NULL.
pub fn normalize_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// Reject input the schema would refuse, with a readable message.
pub fn validate_create(input: &CreateWorkflowHistory) -> DbResult<()> {
    if input.workflow_id.trim().is_empty() {
        return Err(DbError::Validation("Workflow ID cannot be empty".into()));
    }
    if input.workflow_id.len() > MAX_WORKFLOW_ID_LEN {
        return Err(DbError::Validation(format!(
            "Workflow ID exceeds {} characters",
            MAX_WORKFLOW_ID_LEN
        )));
    }
    validate_name(input.name.as_deref())
}

pub fn validate_name(name: Option<&str>) -> DbResult<()> {
    if let Some(name) = name
        && name.chars().count() > MAX_NAME_LEN
    {
        return Err(DbError::Validation(format!(
            "Version name exceeds {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Parse a stored activation event, if any.
pub fn parse_activation_event(s: Option<String>) -> DbResult<Option<ActivationEvent>> {
    s.map(|s| s.parse::<ActivationEvent>().map_err(DbError::Internal))
        .transpose()
}
