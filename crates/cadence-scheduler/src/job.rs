use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{CompletionInstruction, JobKey, TriggerDefinition, TriggerFiredBundle, TriggerKey};

/// A unit of work the scheduler can run.
///
/// Implementations are registered in a [`JobRegistry`] under the `job_type`
/// name that persisted [`crate::types::JobDefinition`]s refer to.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobExecutionFault>;
}

/// A job's way of reporting failure, with directions for the scheduler.
///
/// This is an outcome, not an error: the firing still completes normally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobExecutionFault {
    pub message: String,
    /// Run the job again right away, within the same firing.
    pub refire_immediately: bool,
    /// Mark the trigger that fired `COMPLETE`.
    pub unschedule_firing_trigger: bool,
    /// Mark every trigger of the job `COMPLETE`.
    pub unschedule_all_triggers: bool,
}

impl JobExecutionFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn refire(mut self) -> Self {
        self.refire_immediately = true;
        self
    }

    pub fn unschedule_firing_trigger(mut self) -> Self {
        self.unschedule_firing_trigger = true;
        self
    }

    pub fn unschedule_all_triggers(mut self) -> Self {
        self.unschedule_all_triggers = true;
        self
    }
}

impl fmt::Display for JobExecutionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// What a job sees of the firing that runs it.
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    /// Ledger entry id of this firing.
    pub fire_instance_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub job_data: serde_json::Value,
    /// True when this run replaces a firing interrupted by a crash.
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// How many times the job was re-run in place for this firing.
    pub refire_count: u32,
}

impl JobExecutionContext {
    pub fn from_bundle(bundle: &TriggerFiredBundle) -> Self {
        Self {
            fire_instance_id: bundle.record.entry_id.clone(),
            trigger_key: bundle.trigger.key.clone(),
            job_key: bundle.job.key.clone(),
            job_data: bundle.job.data.clone(),
            recovering: bundle.recovering,
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            previous_fire_time: bundle.previous_fire_time,
            next_fire_time: bundle.trigger.next_fire_time,
            refire_count: 0,
        }
    }
}

/// How one run of a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Faulted(JobExecutionFault),
    /// The job panicked; the payload message when one was available.
    Panicked(String),
    /// No job is registered under the definition's `job_type`.
    Unregistered(String),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded)
    }
}

/// Map a finished run to the instruction reported back to the store.
///
/// `trigger` is the trigger as advanced by the firing.
pub fn instruction_for(outcome: &ExecutionOutcome, trigger: &TriggerDefinition) -> CompletionInstruction {
    let default = if trigger.next_fire_time.is_none() {
        CompletionInstruction::DeleteTrigger
    } else {
        CompletionInstruction::Noop
    };
    match outcome {
        ExecutionOutcome::Succeeded => default,
        ExecutionOutcome::Faulted(fault) if fault.unschedule_all_triggers => {
            CompletionInstruction::SetAllJobTriggersComplete
        }
        ExecutionOutcome::Faulted(fault) if fault.unschedule_firing_trigger => {
            CompletionInstruction::SetTriggerComplete
        }
        ExecutionOutcome::Faulted(_) => default,
        ExecutionOutcome::Panicked(_) => CompletionInstruction::SetTriggerError,
        ExecutionOutcome::Unregistered(_) => CompletionInstruction::SetAllJobTriggersError,
    }
}

/// Executable jobs by `job_type` name.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under `job_type`, replacing any previous registration.
    pub fn register(&self, job_type: impl Into<String>, job: Arc<dyn Job>) {
        let job_type = job_type.into();
        debug!(%job_type, "job type registered");
        self.jobs
            .write()
            .expect("job registry poisoned")
            .insert(job_type, job);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Job>> {
        self.jobs
            .read()
            .expect("job registry poisoned")
            .get(job_type)
            .cloned()
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self
            .jobs
            .read()
            .expect("job registry poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
