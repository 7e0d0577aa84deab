//! One compaction cycle: compute the window, enumerate workflows, prune each
//! in turn and throttle on volume.

use std::collections::VecDeque;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{clock::Clock, window::CompactionWindow};
use crate::{
    config::CompactionConfig,
    db::{DbResult, WorkflowHistoryRepo},
    models::PruneResult,
    observability::metrics,
};

/// A workflow whose pruning failed, carried to later cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRetry {
    pub workflow_id: String,
    /// The window of the cycle that failed, not the window of the retry.
    pub window: CompactionWindow,
    /// Failed attempts so far.
    pub attempts: u32,
}

/// Failed workflows awaiting another attempt.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<PendingRetry>,
}

impl RetryQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRetry> {
        self.entries.iter()
    }

    fn push(&mut self, entry: PendingRetry) {
        self.entries.push_back(entry);
    }

    fn take(&mut self) -> VecDeque<PendingRetry> {
        std::mem::take(&mut self.entries)
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub window: CompactionWindow,
    pub dry_run: bool,
    /// Distinct workflows with versions in the window.
    pub workflows_found: usize,
    /// Workflows pruned successfully, retries included.
    pub workflows_compacted: usize,
    /// Earlier failures attempted again this cycle.
    pub retries_attempted: usize,
    pub failures: usize,
    pub seen: u64,
    pub deleted: u64,
    pub pauses: u32,
    /// Position in the workflow listing at each pause, counting from 1.
    /// Zero for a pause taken while retrying earlier failures.
    pub paused_after: Vec<usize>,
    /// Shutdown stopped the cycle before every workflow was visited.
    pub interrupted: bool,
}

impl CycleReport {
    fn new(window: CompactionWindow, dry_run: bool) -> Self {
        Self {
            window,
            dry_run,
            workflows_found: 0,
            workflows_compacted: 0,
            retries_attempted: 0,
            failures: 0,
            seen: 0,
            deleted: 0,
            pauses: 0,
            paused_after: Vec::new(),
            interrupted: false,
        }
    }
}

/// Runs a single pass over one window.
///
/// Workflows are processed strictly one after another. `shutdown` is observed
/// between workflows and during throttle pauses, never in the middle of a
/// prune.
pub struct CompactionCycle<'a> {
    repo: &'a dyn WorkflowHistoryRepo,
    clock: &'a dyn Clock,
    config: &'a CompactionConfig,
    shutdown: &'a CancellationToken,
    seen_since_pause: u64,
    /// Workflows of the listing visited so far; zero while retrying.
    position: usize,
}

impl<'a> CompactionCycle<'a> {
    pub fn new(
        repo: &'a dyn WorkflowHistoryRepo,
        clock: &'a dyn Clock,
        config: &'a CompactionConfig,
        shutdown: &'a CancellationToken,
    ) -> Self {
        Self {
            repo,
            clock,
            config,
            shutdown,
            seen_since_pause: 0,
            position: 0,
        }
    }

    /// Run the cycle. Earlier failures in `retries` are attempted first, with
    /// their original windows; new failures are added to it.
    pub async fn run(mut self, retries: &mut RetryQueue) -> CycleReport {
        let window = CompactionWindow::ending_before(
            self.clock.now(),
            self.config.minimum_age(),
            self.config.time_window(),
        );
        let mut report = CycleReport::new(window, self.config.dry_run);

        let mut pending = retries.take();
        while let Some(entry) = pending.pop_front() {
            if self.shutdown.is_cancelled() {
                // Keep the untried entries for whoever runs next
                retries.push(entry);
                retries.entries.extend(pending);
                report.interrupted = true;
                return report;
            }
            report.retries_attempted += 1;
            self.process(
                &entry.workflow_id,
                entry.window,
                entry.attempts,
                retries,
                &mut report,
            )
            .await;
            if report.interrupted {
                retries.entries.extend(pending);
                return report;
            }
        }

        let workflow_ids = match self
            .repo
            .get_workflow_ids_in_range(window.start, window.end)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    start = %window.start,
                    end = %window.end,
                    "Failed to list workflows for compaction"
                );
                metrics::record_compaction_error("list");
                return report;
            }
        };
        report.workflows_found = workflow_ids.len();

        for (index, workflow_id) in workflow_ids.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            self.position = index + 1;
            self.process(workflow_id, window, 0, retries, &mut report).await;
            if report.interrupted {
                break;
            }
        }

        report
    }

    async fn process(
        &mut self,
        workflow_id: &str,
        window: CompactionWindow,
        previous_attempts: u32,
        retries: &mut RetryQueue,
        report: &mut CycleReport,
    ) {
        match self.prune(workflow_id, window).await {
            Ok(result) => {
                tracing::debug!(
                    workflow_id,
                    start = %window.start,
                    end = %window.end,
                    seen = result.seen,
                    deleted = result.deleted,
                    retained = result.retained(),
                    dry_run = self.config.dry_run,
                    "Compacted workflow history"
                );
                metrics::record_compaction_prune(result.seen, result.deleted, self.config.dry_run);
                report.workflows_compacted += 1;
                report.seen += result.seen;
                report.deleted += result.deleted;
                self.seen_since_pause += result.seen;
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    workflow_id,
                    start = %window.start,
                    end = %window.end,
                    "Failed to compact workflow history"
                );
                metrics::record_compaction_error("prune");
                report.failures += 1;

                let attempts = previous_attempts + 1;
                if previous_attempts < self.config.max_retry_attempts {
                    retries.push(PendingRetry {
                        workflow_id: workflow_id.to_string(),
                        window,
                        attempts,
                    });
                } else if self.config.max_retry_attempts > 0 {
                    tracing::error!(
                        workflow_id,
                        start = %window.start,
                        end = %window.end,
                        attempts,
                        "Giving up on workflow history compaction"
                    );
                }
            }
        }

        if self.seen_since_pause > self.config.batch_size {
            self.throttle(report).await;
        }
    }

    async fn prune(&self, workflow_id: &str, window: CompactionWindow) -> DbResult<PruneResult> {
        if self.config.dry_run {
            self.repo
                .preview_prune(workflow_id, window.start, window.end)
                .await
        } else {
            self.repo
                .prune_history(workflow_id, window.start, window.end)
                .await
        }
    }

    async fn throttle(&mut self, report: &mut CycleReport) {
        tracing::warn!(
            position = self.position,
            workflows = report.workflows_found,
            seen = self.seen_since_pause,
            batch_size = self.config.batch_size,
            delay_ms = self.config.batch_delay_ms,
            "Compacted {} of {} workflows, pausing after seeing {} versions",
            self.position,
            report.workflows_found,
            self.seen_since_pause
        );
        metrics::record_compaction_throttle();
        report.pauses += 1;
        report.paused_after.push(self.position);

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                report.interrupted = true;
            }
            _ = self.clock.sleep(self.config.batch_delay()) => {}
        }
        self.seen_since_pause = 0;
    }
}
