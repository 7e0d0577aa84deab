use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::SortOrder;
use crate::{
    db::error::DbResult,
    models::{ActivationEvent, CreateWorkflowHistory, PruneResult, WorkflowHistory},
};

#[async_trait]
pub trait WorkflowHistoryRepo: Send + Sync {
    /// Record a new version of a workflow
    async fn create(&self, input: CreateWorkflowHistory) -> DbResult<WorkflowHistory>;

    /// Get a version by its logical version ID
    async fn get_by_version_id(&self, version_id: Uuid) -> DbResult<Option<WorkflowHistory>>;

    /// List every stored version of a workflow, ordered by creation time
    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        order: SortOrder,
    ) -> DbResult<Vec<WorkflowHistory>>;

    /// Label a version. `None` or an empty name removes the label.
    ///
    /// Returns `DbError::NotFound` if the version does not exist.
    async fn set_name(&self, version_id: Uuid, name: Option<String>)
    -> DbResult<WorkflowHistory>;

    /// Mark a version as having been activated or deactivated.
    ///
    /// Returns `DbError::NotFound` if the version does not exist.
    async fn record_activation(
        &self,
        version_id: Uuid,
        event: ActivationEvent,
    ) -> DbResult<WorkflowHistory>;

    // ==================== Compaction Operations ====================

    /// Distinct workflow IDs with at least one version created in `[start, end)`,
    /// in ascending order.
    async fn get_workflow_ids_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<String>>;

    /// Delete superseded versions of a workflow created in `[start, end)`.
    ///
    /// Within the window, ordered by creation time, the first and the last
    /// version are kept as anchors, and named or activated versions are always
    /// kept. Every other version in the window is deleted. Versions outside the
    /// window are never touched.
    ///
    /// `seen` counts the versions in the window before deletion. The count and
    /// the delete happen atomically, and protection is re-checked on the row
    /// being deleted.
    async fn prune_history(
        &self,
        workflow_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<PruneResult>;

    /// Same counts as [`prune_history`](Self::prune_history) without deleting.
    async fn preview_prune(
        &self,
        workflow_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<PruneResult>;
}
