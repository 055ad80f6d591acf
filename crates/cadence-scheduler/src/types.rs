use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{FiredState, TriggerState};

/// Group used when a key is created without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";
/// Group of the one-shot triggers synthesized by crash recovery.
pub const RECOVERY_GROUP: &str = "RECOVERING_JOBS";
pub const DEFAULT_PRIORITY: i32 = 5;

/// Identity of a job: unique `(group, name)` pair within one scheduler name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub group: String,
    pub name: String,
}

impl JobKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    /// A key in [`DEFAULT_GROUP`].
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_GROUP, name)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Identity of a trigger: unique `(group, name)` pair within one scheduler name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub group: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_GROUP, name)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Defines when and how often a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },

    /// Fire every `every_ms` milliseconds, anchored at the trigger's start time.
    /// `repeat_count` is the number of firings after the first; `None` repeats forever.
    Interval {
        every_ms: u64,
        #[serde(default)]
        repeat_count: Option<u32>,
    },

    /// Fire every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },

    /// Fire on a specific weekday (0 = Monday … 6 = Sunday) at the given time (UTC).
    Weekly { day: u8, hour: u8, minute: u8 },

    /// Fire according to a five-field cron expression (UTC).
    Cron { expression: String },
}

/// What to do with a trigger whose fire time was missed by more than the
/// misfire threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireInstruction {
    /// Pick a policy from the schedule type.
    #[default]
    Smart,
    /// Never treat the trigger as misfired; overdue fire times are fired as-is.
    IgnoreMisfires,
    /// Fire once immediately, then continue on the regular schedule.
    FireNow,
    /// Skip the missed fire times and wait for the next regular one.
    DoNothing,
    /// Interval schedules: restart the interval at `now` and fire immediately.
    RescheduleNow,
}

impl MisfireInstruction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfireInstruction::Smart => "smart",
            MisfireInstruction::IgnoreMisfires => "ignore_misfires",
            MisfireInstruction::FireNow => "fire_now",
            MisfireInstruction::DoNothing => "do_nothing",
            MisfireInstruction::RescheduleNow => "reschedule_now",
        }
    }
}

impl fmt::Display for MisfireInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MisfireInstruction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "smart" => Ok(MisfireInstruction::Smart),
            "ignore_misfires" => Ok(MisfireInstruction::IgnoreMisfires),
            "fire_now" => Ok(MisfireInstruction::FireNow),
            "do_nothing" => Ok(MisfireInstruction::DoNothing),
            "reschedule_now" => Ok(MisfireInstruction::RescheduleNow),
            other => Err(format!("unknown misfire instruction: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub key: JobKey,
    /// Name under which the executable job is registered in the [`crate::JobRegistry`].
    pub job_type: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Keep the job when it has no triggers left.
    #[serde(default)]
    pub durable: bool,
    /// At most one firing of this job may be acquired or executing at a time.
    #[serde(default)]
    pub disallow_concurrent_execution: bool,
    /// Re-fire with `recovering = true` if an execution is cut short by a crash.
    #[serde(default)]
    pub requests_recovery: bool,
    /// Arbitrary JSON payload forwarded to the job.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobDefinition {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            description: None,
            durable: false,
            disallow_concurrent_execution: false,
            requests_recovery: false,
            data: serde_json::Value::Null,
        }
    }
}

/// A persisted trigger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub schedule: Schedule,
    #[serde(default)]
    pub misfire_instruction: MisfireInstruction,
    /// Higher fires first when fire times are equal.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Anchor of interval schedules and lower bound for every schedule.
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Null only when the schedule is exhausted or the trigger is complete.
    #[serde(default)]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub times_triggered: u32,
    /// Persisted state. Ignored on insert; the store decides the initial state.
    #[serde(default = "default_state")]
    pub state: TriggerState,
    /// Set only on recovery triggers: the scheduled fire time of the interrupted firing.
    #[serde(default)]
    pub recovering_fire_time: Option<DateTime<Utc>>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_state() -> TriggerState {
    TriggerState::Waiting
}

impl TriggerDefinition {
    pub fn new(
        key: TriggerKey,
        job_key: JobKey,
        schedule: Schedule,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            job_key,
            schedule,
            misfire_instruction: MisfireInstruction::Smart,
            priority: DEFAULT_PRIORITY,
            start_time,
            end_time: None,
            next_fire_time: None,
            previous_fire_time: None,
            times_triggered: 0,
            state: TriggerState::Waiting,
            recovering_fire_time: None,
        }
    }

    pub fn is_recovery(&self) -> bool {
        self.recovering_fire_time.is_some()
    }
}

/// Ledger row describing one acquired or executing firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    /// Generated firing id, primary key of the ledger row.
    pub entry_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    /// Scheduler instance that acquired the firing.
    pub instance_id: String,
    /// When the row was written (acquisition) or last advanced (execution start).
    pub fired_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub priority: i32,
    pub state: FiredState,
    pub recovering: bool,
    pub disallow_concurrent: bool,
    pub requests_recovery: bool,
}

/// What the store should do with a trigger once its firing has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionInstruction {
    Noop,
    /// Delete the trigger if it has no further fire time.
    DeleteTrigger,
    SetTriggerComplete,
    SetTriggerError,
    SetAllJobTriggersComplete,
    SetAllJobTriggersError,
}

impl fmt::Display for CompletionInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletionInstruction::Noop => "noop",
            CompletionInstruction::DeleteTrigger => "delete_trigger",
            CompletionInstruction::SetTriggerComplete => "set_trigger_complete",
            CompletionInstruction::SetTriggerError => "set_trigger_error",
            CompletionInstruction::SetAllJobTriggersComplete => "set_all_job_triggers_complete",
            CompletionInstruction::SetAllJobTriggersError => "set_all_job_triggers_error",
        };
        f.write_str(s)
    }
}

/// A trigger claimed by one acquisition cycle, together with its ledger row.
#[derive(Debug, Clone)]
pub struct AcquiredTrigger {
    pub trigger: TriggerDefinition,
    pub record: FiredTriggerRecord,
}

/// Everything a worker needs to run one firing. Produced by `triggers_fired`.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job: JobDefinition,
    /// Trigger after its fire times were advanced.
    pub trigger: TriggerDefinition,
    pub record: FiredTriggerRecord,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    /// The trigger's previous fire time before this firing advanced it.
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub recovering: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_is_group_dot_name() {
        assert_eq!(TriggerKey::new("reports", "nightly").to_string(), "reports.nightly");
        assert_eq!(JobKey::named("cleanup").to_string(), "DEFAULT.cleanup");
    }

    #[test]
    fn misfire_instruction_round_trips_through_str() {
        for m in [
            MisfireInstruction::Smart,
            MisfireInstruction::IgnoreMisfires,
            MisfireInstruction::FireNow,
            MisfireInstruction::DoNothing,
            MisfireInstruction::RescheduleNow,
        ] {
            assert_eq!(m.as_str().parse::<MisfireInstruction>().unwrap(), m);
        }
        assert!("sometimes".parse::<MisfireInstruction>().is_err());
    }

    #[test]
    fn schedule_json_is_tagged() {
        let s = Schedule::Interval {
            every_ms: 1000,
            repeat_count: None,
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains(r#""kind":"interval""#));

        let parsed: Schedule = serde_json::from_str(r#"{"kind":"interval","every_ms":500}"#).unwrap();
        assert_eq!(
            parsed,
            Schedule::Interval {
                every_ms: 500,
                repeat_count: None
            }
        );
    }
}
