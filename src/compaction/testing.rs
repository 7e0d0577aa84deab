//! In-memory history store and controllable clock for compaction tests.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::{clock::Clock, window::CompactionWindow};
use crate::{
    db::{DbError, DbResult, SortOrder, WorkflowHistoryRepo, normalize_name},
    models::{ActivationEvent, CreateWorkflowHistory, PruneResult, WorkflowHistory},
};

#[derive(Default)]
struct Store {
    rows: Vec<WorkflowHistory>,
    next_id: i64,
}

/// Applies the same anchor and protection rule as the SQL stores.
#[derive(Default)]
pub struct FakeHistoryRepo {
    store: Mutex<Store>,
    prune_calls: Mutex<Vec<(String, CompactionWindow)>>,
    /// Remaining injected failures per workflow
    failures: Mutex<HashMap<String, u32>>,
    fail_listing: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeHistoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `count` unprotected versions spread evenly across `window`.
    pub fn seed(&self, workflow_id: &str, window: CompactionWindow, count: usize) {
        let span = (window.end - window.start).num_milliseconds();
        let step = span / count.max(1) as i64;
        for i in 0..count {
            let ts = window.start + chrono::Duration::milliseconds(step * i as i64);
            self.insert(workflow_id, ts);
        }
    }

    /// Insert `count` unprotected versions starting at `at`, one millisecond apart.
    pub fn seed_at(&self, workflow_id: &str, at: DateTime<Utc>, count: usize) {
        for i in 0..count {
            self.insert(workflow_id, at + chrono::Duration::milliseconds(i as i64));
        }
    }

    fn insert(&self, workflow_id: &str, created_at: DateTime<Utc>) -> WorkflowHistory {
        let mut store = self.store.lock();
        store.next_id += 1;
        let row = WorkflowHistory {
            id: store.next_id,
            version_id: Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            authors: String::new(),
            nodes: serde_json::json!([]),
            connections: serde_json::json!({}),
            name: None,
            activation_event: None,
            created_at,
            updated_at: created_at,
        };
        store.rows.push(row.clone());
        row
    }

    pub fn count(&self, workflow_id: &str) -> usize {
        self.store
            .lock()
            .rows
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .count()
    }

    pub fn prune_calls(&self) -> Vec<(String, CompactionWindow)> {
        self.prune_calls.lock().clone()
    }

    /// Fail the next `times` prunes of `workflow_id`.
    pub fn fail_workflow(&self, workflow_id: &str, times: u32) {
        self.failures.lock().insert(workflow_id.to_string(), times);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Hold every prune until [`release_prunes`](Self::release_prunes).
    pub fn block_prunes(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_prunes(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    async fn enter_prune(
        &self,
        workflow_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<()> {
        self.prune_calls
            .lock()
            .push((workflow_id.to_string(), CompactionWindow { start, end }));

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| DbError::Internal(e.to_string()))?;
        }

        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(workflow_id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(DbError::Internal("injected failure".to_string()));
        }
        Ok(())
    }

    /// IDs of the versions a prune of the window would delete.
    fn doomed(
        &self,
        workflow_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> (u64, Vec<i64>) {
        let window = CompactionWindow { start, end };
        let store = self.store.lock();
        let mut in_window: Vec<&WorkflowHistory> = store
            .rows
            .iter()
            .filter(|r| r.workflow_id == workflow_id && window.contains(r.created_at))
            .collect();
        in_window.sort_by_key(|r| (r.created_at, r.id));

        let total = in_window.len();
        let doomed = in_window
            .iter()
            .enumerate()
            .filter(|(i, r)| *i > 0 && *i + 1 < total && !r.is_protected())
            .map(|(_, r)| r.id)
            .collect();
        (total as u64, doomed)
    }

    fn update(
        &self,
        version_id: Uuid,
        apply: impl FnOnce(&mut WorkflowHistory),
    ) -> DbResult<WorkflowHistory> {
        let mut store = self.store.lock();
        let row = store
            .rows
            .iter_mut()
            .find(|r| r.version_id == version_id)
            .ok_or(DbError::NotFound)?;
        apply(row);
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

#[async_trait]
impl WorkflowHistoryRepo for FakeHistoryRepo {
    async fn create(&self, input: CreateWorkflowHistory) -> DbResult<WorkflowHistory> {
        let created_at = input.created_at.unwrap_or_else(Utc::now);
        let mut row = self.insert(&input.workflow_id, created_at);
        let version_id = input.version_id.unwrap_or(row.version_id);
        let name = normalize_name(input.name);
        row = self.update(row.version_id, |r| {
            r.version_id = version_id;
            r.authors = input.authors;
            r.nodes = input.nodes;
            r.connections = input.connections;
            r.name = name;
            r.activation_event = input.activation_event;
            r.updated_at = created_at;
        })?;
        Ok(row)
    }

    async fn get_by_version_id(&self, version_id: Uuid) -> DbResult<Option<WorkflowHistory>> {
        Ok(self
            .store
            .lock()
            .rows
            .iter()
            .find(|r| r.version_id == version_id)
            .cloned())
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        order: SortOrder,
    ) -> DbResult<Vec<WorkflowHistory>> {
        let mut rows: Vec<WorkflowHistory> = self
            .store
            .lock()
            .rows
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        if order == SortOrder::Desc {
            rows.reverse();
        }
        Ok(rows)
    }

    async fn set_name(&self, version_id: Uuid, name: Option<String>) -> DbResult<WorkflowHistory> {
        let name = normalize_name(name);
        self.update(version_id, |r| r.name = name)
    }

    async fn record_activation(
        &self,
        version_id: Uuid,
        event: ActivationEvent,
    ) -> DbResult<WorkflowHistory> {
        self.update(version_id, |r| r.activation_event = Some(event))
    }

    async fn get_workflow_ids_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<String>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(DbError::Internal("injected listing failure".to_string()));
        }
        let window = CompactionWindow { start, end };
        let mut ids: Vec<String> = self
            .store
            .lock()
            .rows
            .iter()
            .filter(|r| window.contains(r.created_at))
            .map(|r| r.workflow_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn prune_history(
        &self,
        workflow_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<PruneResult> {
        self.enter_prune(workflow_id, start, end).await?;
        let (seen, doomed) = self.doomed(workflow_id, start, end);
        self.store.lock().rows.retain(|r| !doomed.contains(&r.id));
        Ok(PruneResult {
            seen,
            deleted: doomed.len() as u64,
        })
    }

    async fn preview_prune(
        &self,
        workflow_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<PruneResult> {
        self.enter_prune(workflow_id, start, end).await?;
        let (seen, doomed) = self.doomed(workflow_id, start, end);
        Ok(PruneResult {
            seen,
            deleted: doomed.len() as u64,
        })
    }
}

/// Clock with a settable `now` that records every sleep.
pub struct TestClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
    stalled: bool,
}

impl TestClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
            stalled: false,
        }
    }

    /// Sleeps never complete.
    pub fn with_stalled_sleeps(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        if self.stalled {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[tokio::test]
    async fn test_fake_matches_retention_rule() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let window = CompactionWindow {
            start,
            end: start + chrono::Duration::hours(1),
        };
        let repo = FakeHistoryRepo::new();
        repo.seed("wf", window, 5);
        let rows = repo.list_by_workflow("wf", SortOrder::Asc).await.unwrap();
        repo.set_name(rows[2].version_id, Some("keep".into()))
            .await
            .unwrap();

        let result = repo.prune_history("wf", window.start, window.end).await.unwrap();
        assert_eq!(result, PruneResult { seen: 5, deleted: 2 });

        let left: Vec<i64> = repo
            .list_by_workflow("wf", SortOrder::Asc)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(left, vec![rows[0].id, rows[2].id, rows[4].id]);
    }
}
