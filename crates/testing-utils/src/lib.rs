//! # Scheduler Testing Utils
//!
//! Shared testing utilities for the HPC scheduler workspace: mock ports,
//! test data builders and a pre-wired in-memory test environment.
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
