mod workflow_history;

pub use workflow_history::*;
