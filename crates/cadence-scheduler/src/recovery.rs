//! Crash recovery and instance liveness.
//!
//! Ledger rows outlive the process that wrote them. When an instance is
//! known to be gone (every instance on a non-clustered start, instances
//! without a fresh check-in otherwise) its rows are resolved here.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use rusqlite::TransactionBehavior;
use tracing::{debug, info, instrument, warn};

use crate::{
    db::to_millis,
    error::Result,
    ledger,
    lock::{LockGuard, LockName},
    repository::{
        insert_trigger_if_absent, load_job, load_trigger, transition, unblock_job_if_idle,
        JobStore,
    },
    state::{FiredState, TriggerState},
    types::{
        FiredTriggerRecord, JobKey, MisfireInstruction, Schedule, TriggerDefinition, TriggerKey,
        RECOVERY_GROUP,
    },
};

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Acquired-but-unfired triggers returned to `WAITING`.
    pub released: usize,
    /// Recovery triggers created for interrupted executions.
    pub recovered: usize,
    /// Interrupted executions dropped (trigger gone or no recovery requested).
    pub discarded: usize,
    /// Blocked triggers unblocked because their job went idle.
    pub unblocked: usize,
    /// Stranded `ACQUIRED` triggers without a ledger row, reset to `WAITING`.
    pub reset: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        *self == RecoveryReport::default()
    }
}

/// Key of the one-shot trigger that re-runs an interrupted firing.
/// Derived from the ledger entry so repeated passes cannot duplicate it.
pub fn recovery_trigger_key(record: &FiredTriggerRecord) -> TriggerKey {
    TriggerKey::new(
        RECOVERY_GROUP,
        format!("recover_{}_{}", record.instance_id, record.entry_id),
    )
}

impl JobStore {
    /// Record that this instance is alive.
    #[instrument(skip(self, guard))]
    pub fn checkin(&self, guard: &LockGuard, now: DateTime<Utc>, interval: Duration) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        guard.verify(&tx, LockName::StateAccess)?;
        tx.execute(
            "INSERT INTO scheduler_state (sched_name, instance_id, last_checkin, checkin_interval_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (sched_name, instance_id) DO UPDATE SET
                last_checkin = excluded.last_checkin,
                checkin_interval_ms = excluded.checkin_interval_ms",
            rusqlite::params![
                self.sched_name(),
                self.instance_id(),
                to_millis(now),
                interval.num_milliseconds()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Instances considered dead at `now`: those whose last check-in is
    /// older than their own interval plus `grace`, and those that own ledger
    /// rows but never checked in. This instance is listed only when
    /// `include_self` is set.
    pub fn failed_instances(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        include_self: bool,
    ) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut failed = BTreeSet::new();
        let mut known = BTreeSet::new();
        {
            let mut stmt = conn.prepare(
                "SELECT instance_id, last_checkin, checkin_interval_ms
                 FROM scheduler_state WHERE sched_name = ?1",
            )?;
            let rows = stmt.query_map([self.sched_name()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (instance, last, interval) = row?;
                if last + interval + grace.num_milliseconds() < to_millis(now) {
                    failed.insert(instance.clone());
                }
                known.insert(instance);
            }
        }
        for instance in ledger::distinct_instances(&conn, self.sched_name())? {
            if !known.contains(&instance) {
                failed.insert(instance);
            }
        }
        if include_self {
            failed.insert(self.instance_id().to_string());
        } else {
            failed.remove(self.instance_id());
        }
        Ok(failed.into_iter().collect())
    }

    /// Remove this instance's check-in row, e.g. on clean shutdown.
    pub fn remove_instance_state(&self, instance_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM scheduler_state WHERE sched_name = ?1 AND instance_id = ?2",
            rusqlite::params![self.sched_name(), instance_id],
        )?;
        Ok(n > 0)
    }

    /// Every instance that owns ledger rows; all of them are orphaned on a
    /// non-clustered start.
    pub fn instances_with_fired_triggers(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        ledger::distinct_instances(&conn, self.sched_name())
    }

    /// Resolve the ledger rows of dead `instances` and reset stranded states.
    ///
    /// Idempotent: each row is deleted in the transaction that handles it and
    /// recovery triggers are keyed by the row's entry id.
    #[instrument(skip(self, guard), fields(instances = instances.len()))]
    pub fn recover_instances(
        &self,
        guard: &LockGuard,
        instances: &[String],
        now: DateTime<Utc>,
    ) -> Result<RecoveryReport> {
        let sched = self.sched_name().to_string();
        let mut report = RecoveryReport::default();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        guard.verify(&tx, LockName::MisfireAccess)?;

        let mut touched_jobs = BTreeSet::new();
        for instance in instances {
            let rows = ledger::list_for_instance(&tx, &sched, instance, None)?;
            if !rows.is_empty() {
                info!(instance_id = %instance, rows = rows.len(), "recovering orphaned firings");
            }
            for record in rows {
                ledger::remove(&tx, &sched, &record.entry_id)?;
                let trigger = load_trigger(&tx, &sched, &record.trigger_key)?;

                match record.state {
                    FiredState::Acquired => {
                        if transition(
                            &tx,
                            &sched,
                            &record.trigger_key,
                            TriggerState::Acquired,
                            TriggerState::Waiting,
                        )? {
                            report.released += 1;
                        }
                    }
                    FiredState::Executing => {
                        let job = load_job(&tx, &sched, &record.job_key)?;
                        match (&trigger, job) {
                            (Some(_), Some(job)) if record.requests_recovery => {
                                let recovery = recovery_trigger(&record, now, &job.key);
                                if insert_trigger_if_absent(&tx, &sched, &recovery)? {
                                    report.recovered += 1;
                                    info!(
                                        job = %job.key,
                                        trigger = %recovery.key,
                                        "recovery trigger scheduled for interrupted firing"
                                    );
                                }
                            }
                            _ => {
                                report.discarded += 1;
                                debug!(
                                    trigger = %record.trigger_key,
                                    "interrupted firing dropped"
                                );
                            }
                        }
                        if trigger.as_ref().is_some_and(|t| t.state == TriggerState::Executing) {
                            transition(
                                &tx,
                                &sched,
                                &record.trigger_key,
                                TriggerState::Executing,
                                TriggerState::Complete,
                            )?;
                        }
                    }
                }
                touched_jobs.insert(record.job_key.clone());
            }
            if instance != self.instance_id() {
                tx.execute(
                    "DELETE FROM scheduler_state WHERE sched_name = ?1 AND instance_id = ?2",
                    rusqlite::params![sched, instance],
                )?;
            }
        }

        // ACQUIRED without an acquired ledger row can only be left by a crash
        let stranded: Vec<TriggerKey> = {
            let mut stmt = tx.prepare(
                "SELECT t.trigger_group, t.trigger_name FROM triggers t
                 WHERE t.sched_name = ?1 AND t.state = ?2 AND NOT EXISTS (
                    SELECT 1 FROM fired_triggers f
                    WHERE f.sched_name = t.sched_name AND f.trigger_group = t.trigger_group
                      AND f.trigger_name = t.trigger_name AND f.state = ?3)",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![
                    sched,
                    TriggerState::Acquired.as_str(),
                    FiredState::Acquired.as_str()
                ],
                |row| Ok(TriggerKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for key in stranded {
            if transition(&tx, &sched, &key, TriggerState::Acquired, TriggerState::Waiting)? {
                warn!(trigger = %key, "stranded acquired trigger reset");
                report.reset += 1;
            }
        }

        let blocked_jobs: Vec<JobKey> = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT job_group, job_name FROM triggers
                 WHERE sched_name = ?1 AND state IN (?2, ?3)",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![
                    sched,
                    TriggerState::Blocked.as_str(),
                    TriggerState::PausedBlocked.as_str()
                ],
                |row| Ok(JobKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        touched_jobs.extend(blocked_jobs);
        for job in &touched_jobs {
            report.unblocked += unblock_job_if_idle(&tx, &sched, job)?;
        }

        tx.commit()?;
        if !report.is_empty() {
            info!(?report, "recovery pass complete");
        }
        Ok(report)
    }
}

fn recovery_trigger(record: &FiredTriggerRecord, now: DateTime<Utc>, job: &JobKey) -> TriggerDefinition {
    let mut trigger = TriggerDefinition::new(
        recovery_trigger_key(record),
        job.clone(),
        Schedule::Once { at: now },
        now,
    );
    trigger.misfire_instruction = MisfireInstruction::FireNow;
    trigger.priority = record.priority;
    trigger.next_fire_time = Some(now);
    trigger.recovering_fire_time = Some(record.scheduled_fire_time);
    // blocked siblings are resolved by the unblock step of the same pass
    trigger.state = TriggerState::Waiting;
    trigger
}
