//! Shared database repository test infrastructure
//!
//! This module provides a test harness for running the same test logic against
//! both SQLite and PostgreSQL implementations. Tests are organized as:
//!
//! - **Unit tests (SQLite)**: Fast, in-memory tests that run with every `cargo test`
//! - **Integration tests (PostgreSQL)**: Slower tests using testcontainers,
//!   run with `cargo test -- --ignored`
//!
//! Each repository has a test module (e.g., `workflow_history.rs`) containing
//! shared test functions that take a test context, followed by SQLite and
//! PostgreSQL wiring.
//!
//! # Running tests
//!
//! ```bash
//! cargo test                       # Run fast SQLite tests only
//! cargo test -- --ignored          # Run PostgreSQL integration tests (requires Docker)
//! cargo test -- --include-ignored  # Run all tests
//! ```
