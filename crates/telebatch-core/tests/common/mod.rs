//! Shared test infrastructure for telebatch-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::fixtures;
//! ```

pub mod fixtures;
