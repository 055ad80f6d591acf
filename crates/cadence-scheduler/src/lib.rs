//! `cadence-scheduler` — persistent, clusterable job scheduler on SQLite.
//!
//! # Overview
//!
//! Jobs and their triggers live in SQLite tables keyed by a scheduler name.
//! Any number of [`SchedulerEngine`] instances sharing that name and database
//! form a cluster: each acquires due triggers under a database lease lock,
//! fires them, runs the jobs on a bounded worker pool and reports completion.
//! Every acquired or executing firing is written to a ledger first, so the
//! firings of a crashed instance can be released or re-run by a survivor.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                              |
//! |------------|--------------------------------------------------------|
//! | `Once`     | Single fire at an absolute UTC instant                 |
//! | `Interval` | Repeat every N milliseconds from the trigger start     |
//! | `Daily`    | Fire at HH:MM UTC every day                            |
//! | `Weekly`   | Fire at HH:MM UTC on a specific weekday                |
//! | `Cron`     | Five-field cron expression (UTC)                       |

pub mod db;
mod dispatcher;
pub mod engine;
pub mod error;
mod firing;
pub mod job;
pub mod ledger;
pub mod listener;
pub mod lock;
mod recovery;
pub mod repository;
pub mod schedule;
pub mod state;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use job::{ExecutionOutcome, Job, JobExecutionContext, JobExecutionFault, JobRegistry};
pub use listener::{JobListener, ListenerDecision, ListenerRegistry};
pub use lock::{ClusterLock, LockGuard, LockName};
pub use recovery::{recovery_trigger_key, RecoveryReport};
pub use repository::JobStore;
pub use state::{FiredState, TriggerState, TriggerStatus};
pub use types::{
    AcquiredTrigger, CompletionInstruction, FiredTriggerRecord, JobDefinition, JobKey,
    MisfireInstruction, Schedule, TriggerDefinition, TriggerFiredBundle, TriggerKey, RECOVERY_GROUP,
};
