//! Workflow history compaction.
//!
//! Old auto-saved versions of a workflow are thinned out one time window at a
//! time. The [`CompactionScheduler`] runs a [`CompactionCycle`] every window
//! length while this instance leads; each cycle prunes every workflow with
//! versions in the window, pausing whenever it has looked at more than a
//! batch worth of rows.

mod clock;
mod cycle;
mod scheduler;
#[cfg(test)]
mod testing;
mod window;

pub use clock::{Clock, SystemClock};
pub use cycle::{CompactionCycle, CycleReport, PendingRetry, RetryQueue};
pub use scheduler::{CompactionScheduler, SchedulerError, SchedulerState};
pub use window::CompactionWindow;
