use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

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

/// In-window rows of one workflow ranked by creation order.
/// Binds: $1 workflow_id, $2 start, $3 end.
const RANKED_WINDOW: &str = r#"
    SELECT id,
           ROW_NUMBER() OVER (ORDER BY created_at ASC, id ASC) AS position,
           COUNT(*) OVER () AS total,
           (name IS NOT NULL AND name <> '') OR activation_event IS NOT NULL AS protected
    FROM workflow_history
    WHERE workflow_id = $1 AND created_at >= $2 AND created_at < $3
"#;

pub struct PostgresWorkflowHistoryRepo {
    write_pool: PgPool,
    read_pool: PgPool,
}

impl PostgresWorkflowHistoryRepo {
    pub fn new(write_pool: PgPool, read_pool: Option<PgPool>) -> Self {
        let read_pool = read_pool.unwrap_or_else(|| write_pool.clone());
        Self {
            write_pool,
            read_pool,
        }
    }

    fn parse_history(row: &sqlx::postgres::PgRow) -> DbResult<WorkflowHistory> {
        Ok(WorkflowHistory {
            id: row.get("id"),
            version_id: row.get("version_id"),
            workflow_id: row.get("workflow_id"),
            authors: row.get("authors"),
            nodes: row.get("nodes"),
            connections: row.get("connections"),
            name: row.get("name"),
            activation_event: parse_activation_event(row.get("activation_event"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl WorkflowHistoryRepo for PostgresWorkflowHistoryRepo {
    async fn create(&self, input: CreateWorkflowHistory) -> DbResult<WorkflowHistory> {
        validate_create(&input)?;

        let version_id = input.version_id.unwrap_or_else(Uuid::new_v4);
        let now = truncate_to_millis(Utc::now());
        let created_at = input.created_at.map(truncate_to_millis).unwrap_or(now);

        let query = format!(
            r#"
            INSERT INTO workflow_history (version_id, workflow_id, authors, nodes, connections, name, activation_event, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(version_id)
            .bind(&input.workflow_id)
            .bind(&input.authors)
            .bind(&input.nodes)
            .bind(&input.connections)
            .bind(normalize_name(input.name))
            .bind(input.activation_event.map(|e| e.to_string()))
            .bind(created_at)
            .bind(now)
            .fetch_one(&self.write_pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                    DbError::Validation(format!("Version '{}' already exists", version_id))
                }
                _ => DbError::from(e),
            })?;

        Self::parse_history(&row)
    }

    async fn get_by_version_id(&self, version_id: Uuid) -> DbResult<Option<WorkflowHistory>> {
        let query = format!("SELECT {COLUMNS} FROM workflow_history WHERE version_id = $1");
        let row = sqlx::query(&query)
            .bind(version_id)
            .fetch_optional(&self.read_pool)
            .await?;

        row.as_ref().map(Self::parse_history).transpose()
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        order: SortOrder,
    ) -> DbResult<Vec<WorkflowHistory>> {
        let dir = order.as_sql();
        let query = format!(
            "SELECT {COLUMNS} FROM workflow_history WHERE workflow_id = $1 ORDER BY created_at {dir}, id {dir}"
        );
        let rows = sqlx::query(&query)
            .bind(workflow_id)
            .fetch_all(&self.read_pool)
            .await?;

        rows.iter().map(Self::parse_history).collect()
    }

    async fn set_name(
        &self,
        version_id: Uuid,
        name: Option<String>,
    ) -> DbResult<WorkflowHistory> {
        validate_name(name.as_deref())?;

        let query = format!(
            "UPDATE workflow_history SET name = $1, updated_at = $2 WHERE version_id = $3 RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(normalize_name(name))
            .bind(truncate_to_millis(Utc::now()))
            .bind(version_id)
            .fetch_optional(&self.write_pool)
            .await?
            .ok_or(DbError::NotFound)?;

        Self::parse_history(&row)
    }

    async fn record_activation(
        &self,
        version_id: Uuid,
        event: ActivationEvent,
    ) -> DbResult<WorkflowHistory> {
        let query = format!(
            "UPDATE workflow_history SET activation_event = $1, updated_at = $2 WHERE version_id = $3 RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(event.to_string())
            .bind(truncate_to_millis(Utc::now()))
            .bind(version_id)
            .fetch_optional(&self.write_pool)
            .await?
            .ok_or(DbError::NotFound)?;

        Self::parse_history(&row)
    }

    // ==================== Compaction Operations ====================

    // Compaction reads go to the primary so that replica lag cannot hide rows
    // from the pruner that follows.
    async fn get_workflow_ids_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT workflow_id
            FROM workflow_history
            WHERE created_at >= $1 AND created_at < $2
            ORDER BY workflow_id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.write_pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("workflow_id")).collect())
    }

    async fn prune_history(
        &self,
        workflow_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<PruneResult> {
        // Protection is re-checked against the target row, so a version named
        // or activated after the snapshot was taken survives.
        let query = format!(
            r#"
            WITH ranked AS ({RANKED_WINDOW}),
            deleted AS (
                DELETE FROM workflow_history h
                USING ranked r
                WHERE h.id = r.id
                  AND r.position > 1 AND r.position < r.total AND NOT r.protected
                  AND (h.name IS NULL OR h.name = '')
                  AND h.activation_event IS NULL
                RETURNING h.id
            )
            SELECT (SELECT COUNT(*) FROM ranked) AS seen,
                   (SELECT COUNT(*) FROM deleted) AS deleted
            "#
        );
        let row = sqlx::query(&query)
            .bind(workflow_id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.write_pool)
            .await?;

        Ok(PruneResult {
            seen: row.get::<i64, _>("seen") as u64,
            deleted: row.get::<i64, _>("deleted") as u64,
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
                   COUNT(*) FILTER (WHERE position > 1 AND position < total AND NOT protected) AS deleted
            FROM ({RANKED_WINDOW}) ranked
            "#
        );
        let row = sqlx::query(&query)
            .bind(workflow_id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.write_pool)
            .await?;

        Ok(PruneResult {
            seen: row.get::<i64, _>("seen") as u64,
            deleted: row.get::<i64, _>("deleted") as u64,
        })
    }
}
