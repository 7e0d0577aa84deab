mod common;
mod workflow_history;

pub use workflow_history::SqliteWorkflowHistoryRepo;
