use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::common::parse_uuid;
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{
            SortOrder, WorkflowHistoryRepo, normalize_name, parse_activation_event,
            truncate_to_millis, validate_create, validate_name,
        },
    },
    models::{ActivationEvent, CreateWorkflowHistory, PruneResult, WorkflowHistory},
};

const COLUMNS: &str = "id, version_id, workflow_id, authors, nodes, connections, name, activation_event, created_at, updated_at";

/// In-window rows of one workflow ranked by creation order, with the
/// deletion decision for each. Binds: workflow_id, start, end.
const RANKED_WINDOW: &str = r#"
    SELECT id,
           ROW_NUMBER() OVER (ORDER BY created_at ASC, id ASC) AS position,
           COUNT(*) OVER () AS total,
           (name IS NOT NULL AND name <> '') OR activation_event IS NOT NULL AS protected
    FROM workflow_history
    WHERE workflow_id = ? AND created_at >= ? AND created_at < ?
"#;

pub struct SqliteWorkflowHistoryRepo {
    pool: SqlitePool,
}

impl SqliteWorkflowHistoryRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_history(row: &sqlx::sqlite::SqliteRow) -> DbResult<WorkflowHistory> {
        let nodes: String = row.get("nodes");
        let connections: String = row.get("connections");

        Ok(WorkflowHistory {
            id: row.get("id"),
            version_id: parse_uuid(&row.get::<String, _>("version_id"))?,
            workflow_id: row.get("workflow_id"),
            authors: row.get("authors"),
            nodes: serde_json::from_str(&nodes)?,
            connections: serde_json::from_str(&connections)?,
            name: row.get("name"),
            activation_event: parse_activation_event(row.get("activation_event"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn fetch_by_version_id(&self, version_id: Uuid) -> DbResult<Option<WorkflowHistory>> {
        let query = format!("SELECT {COLUMNS} FROM workflow_history WHERE version_id = ?");
        let row = sqlx::query(&query)
            .bind(version_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_history).transpose()
    }
}

#[async_trait]
impl WorkflowHistoryRepo for SqliteWorkflowHistoryRepo {
    async fn create(&self, input: CreateWorkflowHistory) -> DbResult<WorkflowHistory> {
        validate_create(&input)?;

        let version_id = input.version_id.unwrap_or_else(Uuid::new_v4);
        let now = truncate_to_millis(Utc::now());
        let created_at = input.created_at.map(truncate_to_millis).unwrap_or(now);
        let name = normalize_name(input.name);
        let nodes = serde_json::to_string(&input.nodes)?;
        let connections = serde_json::to_string(&input.connections)?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_history (version_id, workflow_id, authors, nodes, connections, name, activation_event, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(version_id.to_string())
        .bind(&input.workflow_id)
        .bind(&input.authors)
        .bind(&nodes)
        .bind(&connections)
        .bind(&name)
        .bind(input.activation_event.map(|e| e.to_string()))
        .bind(created_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DbError::Validation(format!("Version '{}' already exists", version_id))
            }
            _ => DbError::from(e),
        })?;

        Ok(WorkflowHistory {
            id: result.last_insert_rowid(),
            version_id,
            workflow_id: input.workflow_id,
            authors: input.authors,
            nodes: input.nodes,
            connections: input.connections,
            name,
            activation_event: input.activation_event,
            created_at,
            updated_at: now,
        })
    }

    async fn get_by_version_id(&self, version_id: Uuid) -> DbResult<Option<WorkflowHistory>> {
        self.fetch_by_version_id(version_id).await
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        order: SortOrder,
    ) -> DbResult<Vec<WorkflowHistory>> {
        let dir = order.as_sql();
        let query = format!(
            "SELECT {COLUMNS} FROM workflow_history WHERE workflow_id = ? ORDER BY created_at {dir}, id {dir}"
        );
        let rows = sqlx::query(&query)
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::parse_history).collect()
    }

    async fn set_name(
        &self,
        version_id: Uuid,
        name: Option<String>,
    ) -> DbResult<WorkflowHistory> {
        validate_name(name.as_deref())?;

        let result = sqlx::query(
            "UPDATE workflow_history SET name = ?, updated_at = ? WHERE version_id = ?",
        )
        .bind(normalize_name(name))
        .bind(truncate_to_millis(Utc::now()))
        .bind(version_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        self.fetch_by_version_id(version_id)
            .await?
            .ok_or(DbError::NotFound)
    }

    async fn record_activation(
        &self,
        version_id: Uuid,
        event: ActivationEvent,
    ) -> DbResult<WorkflowHistory> {
        let result = sqlx::query(
            "UPDATE workflow_history SET activation_event = ?, updated_at = ? WHERE version_id = ?",
        )
        .bind(event.to_string())
        .bind(truncate_to_millis(Utc::now()))
        .bind(version_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        self.fetch_by_version_id(version_id)
            .await?
            .ok_or(DbError::NotFound)
    }

    // ==================== Compaction Operations ====================

    async fn get_workflow_ids_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT workflow_id
            FROM workflow_history
            WHERE created_at >= ? AND created_at < ?
            ORDER BY workflow_id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("workflow_id")).collect())
    }

    async fn prune_history(
        &self,
        workflow_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<PruneResult> {
        let mut tx = self.pool.begin().await?;

        // The DELETE takes the write lock, so the count below sees exactly the
        // rows that survived it.
        let delete = format!(
            r#"
            DELETE FROM workflow_history
            WHERE id IN (
                SELECT id FROM ({RANKED_WINDOW}) ranked
                WHERE position > 1 AND position < total AND NOT protected
            )
            AND (name IS NULL OR name = '')
            AND activation_event IS NULL
            "#
        );
        let deleted = sqlx::query(&delete)
            .bind(workflow_id)
            .bind(start)
            .bind(end)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let remaining: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM workflow_history
            WHERE workflow_id = ? AND created_at >= ? AND created_at < ?
            "#,
        )
        .bind(workflow_id)
        .bind(start)
        .bind(end)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PruneResult {
            seen: remaining as u64 + deleted,
            deleted,
        })
    }

    async fn preview_prune(
        &self,
        workflow_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<PruneResult> {
        let query = format!(
            r#"
            SELECT COUNT(*) AS seen,
                   COALESCE(SUM(CASE WHEN position > 1 AND position < total AND NOT protected THEN 1 ELSE 0 END), 0) AS deleted
            FROM ({RANKED_WINDOW}) ranked
            "#
        );
        let row = sqlx::query(&query)
            .bind(workflow_id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await?;

        Ok(PruneResult {
            seen: row.get::<i64, _>("seen") as u64,
            deleted: row.get::<i64, _>("deleted") as u64,
        })
    }
}
