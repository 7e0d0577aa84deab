//! Leader-gated background compaction of workflow version history.
//!
//! Every saved edit of a workflow leaves a version row behind. Once versions
//! are old enough, the compactor thins each time window down to its first and
//! last version plus every version that was named or activated.

pub mod cluster;
pub mod compaction;
pub mod config;
pub mod db;
pub mod models;
pub mod observability;
