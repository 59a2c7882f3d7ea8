//! # gauntlet-core
//!
//! Core types for gauntlet, a validation pipeline runner with a
//! content-addressed run cache.
//!
//! - Runs are identified by (content hash, working directory, command)
//! - Only successful runs are cached, and records are never mutated
//! - Cache faults degrade to misses; they never fail the caller

pub mod config;
mod context;
mod error;
pub mod fail_open;
mod types;

pub use config::{GauntletConfig, Language};
pub use context::{ExecutionContext, FORCE_ENV_VAR};
pub use error::{GauntletError, Result};
pub use types::*;
