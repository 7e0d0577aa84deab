//! Leader-gated timer that runs compaction cycles.
//!
//! ```text
//!            init / takeover (eligible, migrated)
//!   ┌──────┐ ─────────────────────────────────> ┌───────────┐
//!   │ Idle │                                    │ Scheduled │ ── every period ──> cycle
//!   └──────┘ <───────────────────────────────── └───────────┘
//!      │                stepdown                      │
//!      └──────────────── shutdown ──> ┌─────────┐ <────┘
//!                                     │ Stopped │
//!                                     └─────────┘
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{
    clock::Clock,
    cycle::{CompactionCycle, CycleReport, RetryQueue},
};
use crate::{
    cluster::{ClusterLifecycle, InstanceSettings, LifecycleHandler},
    config::{CompactionConfig, InstanceRole, InstanceType},
    db::{ConnectionState, WorkflowHistoryRepo},
    observability::metrics,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Instance role is unset; configure instance.role as leader or follower")]
    RoleUnset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No timer.
    Idle,
    /// A timer is running cycles.
    Scheduled,
    /// Shut down; never schedules again.
    Stopped,
}

struct ScheduledTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs workflow history compaction while this instance is the main leader.
///
/// Cheap to clone; clones share one timer and one retry queue.
#[derive(Clone)]
pub struct CompactionScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    repo: Arc<dyn WorkflowHistoryRepo>,
    clock: Arc<dyn Clock>,
    config: CompactionConfig,
    settings: Arc<InstanceSettings>,
    storage: Arc<ConnectionState>,
    /// Cancelled on shutdown. Doubles as the shutting-down flag.
    shutdown: CancellationToken,
    timer: Mutex<Option<ScheduledTimer>>,
    cycles: TaskTracker,
    cycle_running: AtomicBool,
    retries: Mutex<RetryQueue>,
}

/// Clears the cycle-in-progress flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CompactionScheduler {
    pub fn new(
        repo: Arc<dyn WorkflowHistoryRepo>,
        clock: Arc<dyn Clock>,
        config: CompactionConfig,
        settings: Arc<InstanceSettings>,
        storage: Arc<ConnectionState>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                repo,
                clock,
                config,
                settings,
                storage,
                shutdown: CancellationToken::new(),
                timer: Mutex::new(None),
                cycles: TaskTracker::new(),
                cycle_running: AtomicBool::new(false),
                retries: Mutex::new(RetryQueue::default()),
            }),
        }
    }

    /// Subscribe to leadership and shutdown events.
    pub fn register(&self, lifecycle: &ClusterLifecycle) {
        lifecycle.register(Arc::new(self.clone()));
    }

    /// Check the configured role and start at once if already leader.
    pub fn init(&self) -> Result<(), SchedulerError> {
        match self.inner.settings.role() {
            InstanceRole::Unset => {
                tracing::error!("Cannot start workflow history compaction: instance role is unset");
                Err(SchedulerError::RoleUnset)
            }
            InstanceRole::Leader => {
                self.start_compacting();
                Ok(())
            }
            InstanceRole::Follower => Ok(()),
        }
    }

    /// Only the leading main instance compacts.
    pub fn is_enabled(&self) -> bool {
        self.inner.settings.instance_type() == InstanceType::Main
            && self.inner.settings.is_leader()
    }

    pub fn state(&self) -> SchedulerState {
        if self.inner.shutdown.is_cancelled() {
            return SchedulerState::Stopped;
        }
        match self.inner.timer.lock().as_ref() {
            Some(timer) if !timer.handle.is_finished() => SchedulerState::Scheduled,
            _ => SchedulerState::Idle,
        }
    }

    /// Start the timer. Returns whether a new timer was started.
    pub fn start_compacting(&self) -> bool {
        let inner = &self.inner;
        if !inner.config.enabled {
            tracing::debug!("Workflow history compaction is disabled");
            return false;
        }
        if inner.shutdown.is_cancelled() {
            return false;
        }
        if !self.is_enabled() {
            tracing::debug!(
                instance_type = %inner.settings.instance_type(),
                role = %inner.settings.role(),
                "Not compacting workflow history on this instance"
            );
            return false;
        }
        if !inner.storage.is_migrated() {
            tracing::warn!("Storage is not migrated, not compacting workflow history");
            return false;
        }

        let mut timer = inner.timer.lock();
        if timer.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "No async runtime to schedule compaction on");
                return false;
            }
        };

        let cancel = inner.shutdown.child_token();
        let handle = runtime.spawn(Arc::clone(inner).run_timer(cancel.clone()));
        *timer = Some(ScheduledTimer { cancel, handle });

        tracing::info!(
            period_secs = inner.config.period().as_secs(),
            minimum_age_hours = inner.config.minimum_age_hours,
            batch_size = inner.config.batch_size,
            dry_run = inner.config.dry_run,
            "Started workflow history compaction"
        );
        true
    }

    /// Cancel the timer. A cycle already running finishes on its own.
    pub fn stop_compacting(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.cancel.cancel();
            tracing::info!("Stopped workflow history compaction");
        }
    }

    /// Stop permanently. A running cycle stops at the next workflow boundary.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop_compacting();
        self.inner.cycles.close();
    }

    /// Run one cycle now, regardless of role.
    ///
    /// Returns `None` if a cycle is already running.
    pub async fn compact_now(&self) -> Option<CycleReport> {
        self.inner.run_cycle().await
    }

    /// Failures waiting for another attempt.
    pub fn pending_retries(&self) -> usize {
        self.inner.retries.lock().len()
    }

    /// Wait for cycles started by the timer to finish.
    pub async fn wait_for_cycles(&self) {
        self.inner.cycles.close();
        self.inner.cycles.wait().await;
    }
}

impl SchedulerInner {
    async fn run_timer(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.period();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(period) => {}
            }
            let worker = Arc::clone(&self);
            self.cycles.spawn(async move {
                worker.run_cycle().await;
            });
        }
    }

    async fn run_cycle(&self) -> Option<CycleReport> {
        if self.cycle_running.swap(true, Ordering::AcqRel) {
            tracing::warn!("Previous workflow history compaction cycle still running, skipping");
            return None;
        }
        let _guard = CycleGuard(&self.cycle_running);
        let started = tokio::time::Instant::now();

        // Only one cycle runs at a time, so the queue can leave the lock
        let mut retries = std::mem::take(&mut *self.retries.lock());
        let report = CompactionCycle::new(
            self.repo.as_ref(),
            self.clock.as_ref(),
            &self.config,
            &self.shutdown,
        )
        .run(&mut retries)
        .await;
        *self.retries.lock() = retries;

        let elapsed = started.elapsed();
        metrics::record_compaction_cycle(elapsed.as_secs_f64(), report.interrupted);
        tracing::info!(
            start = %report.window.start,
            end = %report.window.end,
            workflows = report.workflows_found,
            compacted = report.workflows_compacted,
            retried = report.retries_attempted,
            failures = report.failures,
            seen = report.seen,
            deleted = report.deleted,
            pauses = report.pauses,
            interrupted = report.interrupted,
            dry_run = report.dry_run,
            elapsed_ms = elapsed.as_millis() as u64,
            "Workflow history compaction cycle finished"
        );
        Some(report)
    }
}

impl LifecycleHandler for CompactionScheduler {
    fn name(&self) -> &str {
        "workflow-history-compaction"
    }

    fn on_leader_takeover(&self) {
        self.start_compacting();
    }

    fn on_leader_stepdown(&self) {
        self.stop_compacting();
    }

    fn on_shutdown(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::compaction::{
        testing::{FakeHistoryRepo, TestClock},
        window::CompactionWindow,
    };

    const PERIOD: Duration = Duration::from_secs(3600);

    struct Harness {
        repo: Arc<FakeHistoryRepo>,
        lifecycle: ClusterLifecycle,
        scheduler: CompactionScheduler,
    }

    fn harness_with(
        instance_type: InstanceType,
        role: InstanceRole,
        storage: ConnectionState,
        config: CompactionConfig,
    ) -> Harness {
        let clock = TestClock::new(chrono::Utc.with_ymd_and_hms(2025, 3, 12, 12, 0, 0).unwrap());
        let window = CompactionWindow::ending_before(
            clock.now(),
            config.minimum_age(),
            config.time_window(),
        );
        let repo = Arc::new(FakeHistoryRepo::new());
        repo.seed("wf-a", window, 3);

        let settings = Arc::new(InstanceSettings::new(instance_type, role));
        let lifecycle = ClusterLifecycle::new(Arc::clone(&settings));
        let scheduler = CompactionScheduler::new(
            repo.clone(),
            Arc::new(clock),
            config,
            settings,
            Arc::new(storage),
        );
        scheduler.register(&lifecycle);
        Harness {
            repo,
            lifecycle,
            scheduler,
        }
    }

    fn harness(role: InstanceRole) -> Harness {
        harness_with(
            InstanceType::Main,
            role,
            ConnectionState::migrated(),
            CompactionConfig::default(),
        )
    }

    /// Let the paused clock run past `periods` timer firings.
    async fn elapse(periods: u32) {
        tokio::time::sleep(PERIOD * periods + Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_with_unset_role_fails() {
        let h = harness(InstanceRole::Unset);
        assert!(matches!(h.scheduler.init(), Err(SchedulerError::RoleUnset)));
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_at_init_schedules() {
        let h = harness(InstanceRole::Leader);
        h.scheduler.init().unwrap();
        assert_eq!(h.scheduler.state(), SchedulerState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_stays_idle_until_takeover() {
        let h = harness(InstanceRole::Follower);
        h.scheduler.init().unwrap();
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);

        elapse(2).await;
        assert!(h.repo.prune_calls().is_empty());

        h.lifecycle.take_over_leadership();
        assert_eq!(h.scheduler.state(), SchedulerState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_runs_one_cycle_per_period() {
        let h = harness(InstanceRole::Leader);
        h.scheduler.init().unwrap();

        elapse(1).await;
        assert_eq!(h.repo.prune_calls().len(), 1);
        assert_eq!(h.repo.count("wf-a"), 2);

        tokio::time::sleep(PERIOD).await;
        assert_eq!(h.repo.prune_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_takeover_keeps_one_timer() {
        let h = harness(InstanceRole::Leader);
        h.scheduler.init().unwrap();
        assert!(!h.scheduler.start_compacting());
        h.scheduler.on_leader_takeover();

        elapse(1).await;
        assert_eq!(h.repo.prune_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stepdown_idles() {
        let h = harness(InstanceRole::Leader);
        h.scheduler.init().unwrap();

        h.lifecycle.step_down();
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
        // Stepping down twice is harmless
        h.scheduler.on_leader_stepdown();

        elapse(2).await;
        assert!(h.repo.prune_calls().is_empty());

        h.lifecycle.take_over_leadership();
        assert_eq!(h.scheduler.state(), SchedulerState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_permanent() {
        let h = harness(InstanceRole::Leader);
        h.scheduler.init().unwrap();

        h.lifecycle.shutdown();
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);

        assert!(!h.scheduler.start_compacting());
        h.scheduler.on_leader_takeover();
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);

        elapse(2).await;
        assert!(h.repo.prune_calls().is_empty());
        h.scheduler.wait_for_cycles().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmigrated_storage_prevents_scheduling() {
        let h = harness_with(
            InstanceType::Main,
            InstanceRole::Leader,
            ConnectionState::new(),
            CompactionConfig::default(),
        );
        h.scheduler.init().unwrap();
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_main_instances_compact() {
        for instance_type in [InstanceType::Worker, InstanceType::Webhook] {
            let h = harness_with(
                instance_type,
                InstanceRole::Leader,
                ConnectionState::migrated(),
                CompactionConfig::default(),
            );
            assert!(!h.scheduler.is_enabled());
            h.scheduler.init().unwrap();
            assert_eq!(h.scheduler.state(), SchedulerState::Idle);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_config_stays_idle() {
        let h = harness_with(
            InstanceType::Main,
            InstanceRole::Leader,
            ConnectionState::migrated(),
            CompactionConfig {
                enabled: false,
                ..Default::default()
            },
        );
        assert!(h.scheduler.is_enabled());
        h.scheduler.init().unwrap();
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_never_overlap() {
        let h = harness(InstanceRole::Leader);
        h.repo.block_prunes();
        h.scheduler.init().unwrap();

        // The first cycle is stuck in its prune when the second tick fires
        elapse(2).await;
        assert_eq!(h.repo.prune_calls().len(), 1);
        assert!(h.scheduler.compact_now().await.is_none());

        h.repo.release_prunes();
        tokio::time::sleep(PERIOD).await;
        assert_eq!(h.repo.prune_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_workflow_retried_next_cycle() {
        let h = harness(InstanceRole::Leader);
        h.repo.fail_workflow("wf-a", 1);
        h.scheduler.init().unwrap();

        elapse(1).await;
        assert_eq!(h.repo.count("wf-a"), 3);
        assert_eq!(h.scheduler.pending_retries(), 1);

        tokio::time::sleep(PERIOD).await;
        assert_eq!(h.repo.count("wf-a"), 2);
        assert_eq!(h.scheduler.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compact_now_ignores_role() {
        let h = harness(InstanceRole::Follower);
        let report = h.scheduler.compact_now().await.unwrap();
        assert_eq!(report.workflows_found, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    }
}
