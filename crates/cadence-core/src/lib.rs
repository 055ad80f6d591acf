//! `cadence-core` — configuration and shared error types for the Cadence
//! scheduler workspace.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, ClusterConfig, DatabaseConfig, SchedulerConfig};
pub use error::{CadenceError, Result};
