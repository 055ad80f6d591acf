use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use crate::{
    db::{enum_col, json_col, opt_millis, opt_time_col, time_col, to_millis},
    error::{Result, SchedulerError},
    ledger,
    schedule::{apply_misfire, first_fire_time, is_misfired, validate},
    state::{FiredState, TriggerState},
    types::{FiredTriggerRecord, JobDefinition, JobKey, TriggerDefinition, TriggerKey},
};

/// Transactional store for jobs, triggers and the fired-trigger ledger.
///
/// Cheap to clone. Each scheduler instance owns one connection; instances
/// sharing a cluster share only the database file.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
    sched_name: String,
    instance_id: String,
    misfire_threshold: chrono::Duration,
}

impl JobStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        sched_name: impl Into<String>,
        instance_id: impl Into<String>,
        misfire_threshold: std::time::Duration,
    ) -> Self {
        Self {
            conn,
            sched_name: sched_name.into(),
            instance_id: instance_id.into(),
            misfire_threshold: chrono::Duration::milliseconds(misfire_threshold.as_millis() as i64),
        }
    }

    pub fn sched_name(&self) -> &str {
        &self.sched_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn misfire_threshold(&self) -> chrono::Duration {
        self.misfire_threshold
    }

    /// The shared connection, for building a [`crate::lock::ClusterLock`] on it.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::Poisoned)
    }

    // ── jobs ─────────────────────────────────────────────────────────────────

    /// Store a job. A non-durable job must already have a trigger.
    #[instrument(skip(self, job), fields(job = %job.key, replace))]
    pub fn store_job(&self, job: &JobDefinition, replace: bool) -> Result<()> {
        check_job(job)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = load_job(&tx, &self.sched_name, &job.key)?.is_some();
        if exists && !replace {
            return Err(SchedulerError::AlreadyExists {
                kind: "job",
                key: job.key.to_string(),
            });
        }
        if !job.durable && triggers_of_job(&tx, &self.sched_name, &job.key)?.is_empty() {
            return Err(SchedulerError::InvalidJob(format!(
                "job {} is not durable and has no trigger",
                job.key
            )));
        }
        write_job(&tx, &self.sched_name, job)?;
        tx.commit()?;
        info!(replaced = exists, "job stored");
        Ok(())
    }

    /// Store a new job together with its first trigger, atomically.
    #[instrument(skip(self, job, trigger), fields(job = %job.key, trigger = %trigger.key))]
    pub fn store_job_and_trigger(
        &self,
        job: &JobDefinition,
        trigger: &TriggerDefinition,
    ) -> Result<TriggerDefinition> {
        check_job(job)?;
        if trigger.job_key != job.key {
            return Err(SchedulerError::InvalidJob(format!(
                "trigger {} references job {}, not {}",
                trigger.key, trigger.job_key, job.key
            )));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if load_job(&tx, &self.sched_name, &job.key)?.is_some() {
            return Err(SchedulerError::AlreadyExists {
                kind: "job",
                key: job.key.to_string(),
            });
        }
        if load_trigger(&tx, &self.sched_name, &trigger.key)?.is_some() {
            return Err(SchedulerError::AlreadyExists {
                kind: "trigger",
                key: trigger.key.to_string(),
            });
        }
        write_job(&tx, &self.sched_name, job)?;
        let stored = prepare_new_trigger(&tx, &self.sched_name, trigger, job)?;
        insert_trigger(&tx, &self.sched_name, &stored)?;
        tx.commit()?;
        info!(next_fire_time = ?stored.next_fire_time, "job and trigger stored");
        Ok(stored)
    }

    /// Store a trigger for an existing job. Returns the trigger as persisted.
    #[instrument(skip(self, trigger), fields(trigger = %trigger.key, job = %trigger.job_key, replace))]
    pub fn store_trigger(
        &self,
        trigger: &TriggerDefinition,
        replace: bool,
    ) -> Result<TriggerDefinition> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&tx, &self.sched_name, &trigger.job_key)?.ok_or_else(|| {
            SchedulerError::NotFound {
                kind: "job",
                key: trigger.job_key.to_string(),
            }
        })?;
        if load_trigger(&tx, &self.sched_name, &trigger.key)?.is_some() {
            if !replace {
                return Err(SchedulerError::AlreadyExists {
                    kind: "trigger",
                    key: trigger.key.to_string(),
                });
            }
            delete_trigger_row(&tx, &self.sched_name, &trigger.key)?;
        }
        let stored = prepare_new_trigger(&tx, &self.sched_name, trigger, &job)?;
        insert_trigger(&tx, &self.sched_name, &stored)?;
        tx.commit()?;
        info!(state = %stored.state, next_fire_time = ?stored.next_fire_time, "trigger stored");
        Ok(stored)
    }

    /// Delete a job, its triggers and their ledger rows. Returns false if absent.
    #[instrument(skip(self), fields(job = %key))]
    pub fn remove_job(&self, key: &JobKey) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let purged = ledger::remove_for_job(&tx, &self.sched_name, key)?;
        let triggers = tx.execute(
            "DELETE FROM triggers WHERE sched_name = ?1 AND job_group = ?2 AND job_name = ?3",
            rusqlite::params![self.sched_name, key.group, key.name],
        )?;
        let removed = delete_job_row(&tx, &self.sched_name, key)?;
        tx.commit()?;
        if removed {
            info!(triggers, purged, "job removed");
        }
        Ok(removed)
    }

    /// Delete a trigger and its ledger rows. A non-durable job left without
    /// triggers is deleted as well. Returns false if the trigger was absent.
    #[instrument(skip(self), fields(trigger = %key))]
    pub fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(trigger) = load_trigger(&tx, &self.sched_name, key)? else {
            return Ok(false);
        };
        remove_trigger_cascading(&tx, &self.sched_name, &trigger)?;
        tx.commit()?;
        info!("trigger removed");
        Ok(true)
    }

    /// Swap the trigger stored under `key` for `new_trigger` (same job).
    /// Returns the stored replacement, or `None` if `key` did not exist.
    #[instrument(skip(self, new_trigger), fields(trigger = %key, replacement = %new_trigger.key))]
    pub fn replace_trigger(
        &self,
        key: &TriggerKey,
        new_trigger: &TriggerDefinition,
    ) -> Result<Option<TriggerDefinition>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(old) = load_trigger(&tx, &self.sched_name, key)? else {
            return Ok(None);
        };
        if old.job_key != new_trigger.job_key {
            return Err(SchedulerError::InvalidJob(format!(
                "replacement trigger {} belongs to job {}, not {}",
                new_trigger.key, new_trigger.job_key, old.job_key
            )));
        }
        let job = load_job(&tx, &self.sched_name, &old.job_key)?.ok_or_else(|| {
            SchedulerError::ConsistencyViolation(format!(
                "trigger {key} references missing job {}",
                old.job_key
            ))
        })?;
        delete_trigger_row(&tx, &self.sched_name, key)?;
        if new_trigger.key != *key && load_trigger(&tx, &self.sched_name, &new_trigger.key)?.is_some()
        {
            return Err(SchedulerError::AlreadyExists {
                kind: "trigger",
                key: new_trigger.key.to_string(),
            });
        }
        let stored = prepare_new_trigger(&tx, &self.sched_name, new_trigger, &job)?;
        insert_trigger(&tx, &self.sched_name, &stored)?;
        tx.commit()?;
        info!(next_fire_time = ?stored.next_fire_time, "trigger replaced");
        Ok(Some(stored))
    }

    pub fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDefinition>> {
        let conn = self.conn()?;
        load_job(&conn, &self.sched_name, key)
    }

    pub fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<TriggerDefinition>> {
        let conn = self.conn()?;
        load_trigger(&conn, &self.sched_name, key)
    }

    pub fn triggers_of_job(&self, key: &JobKey) -> Result<Vec<TriggerDefinition>> {
        let conn = self.conn()?;
        triggers_of_job(&conn, &self.sched_name, key)
    }

    /// All triggers, ordered by next fire time (exhausted ones last).
    pub fn list_triggers(&self) -> Result<Vec<TriggerDefinition>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE sched_name = ?1
             ORDER BY next_fire_time IS NULL, next_fire_time, trigger_group, trigger_name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&self.sched_name], row_to_trigger)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE sched_name = ?1 ORDER BY job_group, job_name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&self.sched_name], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        let conn = self.conn()?;
        current_state(&conn, &self.sched_name, key)
    }

    // ── pause / resume / reset ───────────────────────────────────────────────

    /// Pause a trigger. Returns false if it does not exist.
    #[instrument(skip(self), fields(trigger = %key))]
    pub fn pause_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(state) = current_state(&tx, &self.sched_name, key)? else {
            return Ok(false);
        };
        let paused = state.paused();
        if paused != state {
            transition(&tx, &self.sched_name, key, state, paused)?;
        }
        tx.commit()?;
        debug!(from = %state, to = %paused, "trigger paused");
        Ok(true)
    }

    /// Resume a paused trigger, applying its misfire policy if its fire time
    /// passed while it was paused. Returns false if it does not exist.
    #[instrument(skip(self), fields(trigger = %key))]
    pub fn resume_trigger(&self, key: &TriggerKey, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(trigger) = load_trigger(&tx, &self.sched_name, key)? else {
            return Ok(false);
        };
        self.resume_in(&tx, trigger, now)?;
        tx.commit()?;
        Ok(true)
    }

    fn resume_in(&self, conn: &Connection, mut trigger: TriggerDefinition, now: DateTime<Utc>) -> Result<()> {
        let from = trigger.state;
        let to = match from {
            TriggerState::Paused => {
                let job_blocked = match load_job(conn, &self.sched_name, &trigger.job_key)? {
                    Some(job) => {
                        job.disallow_concurrent_execution
                            && ledger::has_active_for_job(conn, &self.sched_name, &job.key)?
                    }
                    None => false,
                };
                if job_blocked {
                    TriggerState::Blocked
                } else {
                    TriggerState::Waiting
                }
            }
            TriggerState::PausedBlocked => TriggerState::Blocked,
            _ => return Ok(()),
        };

        let mut to = to;
        if is_misfired(&trigger, now, self.misfire_threshold) {
            if apply_misfire(&mut trigger, now).is_none() {
                to = TriggerState::Complete;
            }
            update_fire_times(conn, &self.sched_name, &trigger)?;
            info!(trigger = %trigger.key, next_fire_time = ?trigger.next_fire_time, "misfire applied on resume");
        }
        transition(conn, &self.sched_name, &trigger.key, from, to)?;
        debug!(trigger = %trigger.key, %from, %to, "trigger resumed");
        Ok(())
    }

    /// Pause every trigger of a job. Returns false if the job does not exist.
    #[instrument(skip(self), fields(job = %key))]
    pub fn pause_job(&self, key: &JobKey) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if load_job(&tx, &self.sched_name, key)?.is_none() {
            return Ok(false);
        }
        for trigger in triggers_of_job(&tx, &self.sched_name, key)? {
            let paused = trigger.state.paused();
            if paused != trigger.state {
                transition(&tx, &self.sched_name, &trigger.key, trigger.state, paused)?;
            }
        }
        tx.commit()?;
        info!("job paused");
        Ok(true)
    }

    /// Resume every trigger of a job. Returns false if the job does not exist.
    #[instrument(skip(self), fields(job = %key))]
    pub fn resume_job(&self, key: &JobKey, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if load_job(&tx, &self.sched_name, key)?.is_none() {
            return Ok(false);
        }
        for trigger in triggers_of_job(&tx, &self.sched_name, key)? {
            self.resume_in(&tx, trigger, now)?;
        }
        tx.commit()?;
        info!("job resumed");
        Ok(true)
    }

    /// Move an `ERROR` trigger back to `WAITING`. Returns false if it does not exist.
    #[instrument(skip(self), fields(trigger = %key))]
    pub fn reset_trigger_from_error(&self, key: &TriggerKey) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(state) = current_state(&tx, &self.sched_name, key)? else {
            return Ok(false);
        };
        if state == TriggerState::Error {
            transition(&tx, &self.sched_name, key, state, TriggerState::Waiting)?;
            info!("trigger reset from error");
        }
        tx.commit()?;
        Ok(true)
    }

    /// Delete every job, trigger and ledger row of this scheduler name.
    #[instrument(skip(self), fields(sched = %self.sched_name))]
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for table in ["fired_triggers", "triggers", "jobs"] {
            tx.execute(&format!("DELETE FROM {table} WHERE sched_name = ?1"), [&self.sched_name])?;
        }
        tx.commit()?;
        warn!("scheduler data cleared");
        Ok(())
    }

    /// Every ledger row of this scheduler name.
    pub fn fired_records(&self) -> Result<Vec<FiredTriggerRecord>> {
        let conn = self.conn()?;
        ledger::list_all(&conn, &self.sched_name)
    }

    /// Ledger rows of this instance that are executing right now.
    pub fn currently_executing(&self) -> Result<Vec<FiredTriggerRecord>> {
        let conn = self.conn()?;
        ledger::list_for_instance(
            &conn,
            &self.sched_name,
            &self.instance_id,
            Some(FiredState::Executing),
        )
    }
}

fn check_job(job: &JobDefinition) -> Result<()> {
    if job.job_type.trim().is_empty() {
        return Err(SchedulerError::InvalidJob(format!("job {} has no job type", job.key)));
    }
    Ok(())
}

// ── row helpers shared by firing and recovery ────────────────────────────────

const JOB_COLUMNS: &str = "job_group, job_name, job_type, description, durable,
     disallow_concurrent, requests_recovery, job_data";

pub(crate) const TRIGGER_COLUMNS: &str = "trigger_group, trigger_name, job_group, job_name,
     schedule, misfire_instruction, priority, start_time, end_time, next_fire_time,
     previous_fire_time, times_triggered, state, recovering_fire_time";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobDefinition> {
    Ok(JobDefinition {
        key: JobKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        job_type: row.get(2)?,
        description: row.get(3)?,
        durable: row.get(4)?,
        disallow_concurrent_execution: row.get(5)?,
        requests_recovery: row.get(6)?,
        data: json_col(row, 7)?,
    })
}

pub(crate) fn row_to_trigger(row: &Row<'_>) -> rusqlite::Result<TriggerDefinition> {
    Ok(TriggerDefinition {
        key: TriggerKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        job_key: JobKey::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
        schedule: json_col(row, 4)?,
        misfire_instruction: enum_col(row, 5)?,
        priority: row.get(6)?,
        start_time: time_col(row, 7)?,
        end_time: opt_time_col(row, 8)?,
        next_fire_time: opt_time_col(row, 9)?,
        previous_fire_time: opt_time_col(row, 10)?,
        times_triggered: row.get(11)?,
        state: enum_col(row, 12)?,
        recovering_fire_time: opt_time_col(row, 13)?,
    })
}

pub(crate) fn load_job(conn: &Connection, sched: &str, key: &JobKey) -> Result<Option<JobDefinition>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM jobs
         WHERE sched_name = ?1 AND job_group = ?2 AND job_name = ?3"
    );
    Ok(conn
        .query_row(&sql, rusqlite::params![sched, key.group, key.name], row_to_job)
        .optional()?)
}

pub(crate) fn load_trigger(
    conn: &Connection,
    sched: &str,
    key: &TriggerKey,
) -> Result<Option<TriggerDefinition>> {
    let sql = format!(
        "SELECT {TRIGGER_COLUMNS} FROM triggers
         WHERE sched_name = ?1 AND trigger_group = ?2 AND trigger_name = ?3"
    );
    Ok(conn
        .query_row(&sql, rusqlite::params![sched, key.group, key.name], row_to_trigger)
        .optional()?)
}

pub(crate) fn triggers_of_job(
    conn: &Connection,
    sched: &str,
    key: &JobKey,
) -> Result<Vec<TriggerDefinition>> {
    let sql = format!(
        "SELECT {TRIGGER_COLUMNS} FROM triggers
         WHERE sched_name = ?1 AND job_group = ?2 AND job_name = ?3
         ORDER BY trigger_group, trigger_name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params![sched, key.group, key.name], row_to_trigger)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn current_state(conn: &Connection, sched: &str, key: &TriggerKey) -> Result<Option<TriggerState>> {
    Ok(conn
        .query_row(
            "SELECT state FROM triggers
             WHERE sched_name = ?1 AND trigger_group = ?2 AND trigger_name = ?3",
            rusqlite::params![sched, key.group, key.name],
            |row| enum_col(row, 0),
        )
        .optional()?)
}

fn write_job(conn: &Connection, sched: &str, job: &JobDefinition) -> Result<()> {
    let data = serde_json::to_string(&job.data)?;
    conn.execute(
        "INSERT INTO jobs
         (sched_name, job_group, job_name, job_type, description, durable,
          disallow_concurrent, requests_recovery, job_data)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
         ON CONFLICT (sched_name, job_group, job_name) DO UPDATE SET
            job_type = excluded.job_type,
            description = excluded.description,
            durable = excluded.durable,
            disallow_concurrent = excluded.disallow_concurrent,
            requests_recovery = excluded.requests_recovery,
            job_data = excluded.job_data",
        rusqlite::params![
            sched,
            job.key.group,
            job.key.name,
            job.job_type,
            job.description,
            job.durable,
            job.disallow_concurrent_execution,
            job.requests_recovery,
            data
        ],
    )?;
    Ok(())
}

fn delete_job_row(conn: &Connection, sched: &str, key: &JobKey) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM jobs WHERE sched_name = ?1 AND job_group = ?2 AND job_name = ?3",
        rusqlite::params![sched, key.group, key.name],
    )?;
    Ok(n > 0)
}

/// Reset runtime fields, compute the first fire time and pick the initial state.
fn prepare_new_trigger(
    conn: &Connection,
    sched: &str,
    trigger: &TriggerDefinition,
    job: &JobDefinition,
) -> Result<TriggerDefinition> {
    validate(&trigger.schedule)?;
    if trigger.end_time.is_some_and(|end| end < trigger.start_time) {
        return Err(SchedulerError::InvalidSchedule(format!(
            "trigger {} ends before it starts",
            trigger.key
        )));
    }
    let mut stored = trigger.clone();
    stored.times_triggered = 0;
    stored.previous_fire_time = None;
    stored.next_fire_time = first_fire_time(&stored);
    if stored.next_fire_time.is_none() {
        return Err(SchedulerError::InvalidSchedule(format!(
            "trigger {} will never fire",
            trigger.key
        )));
    }
    stored.state = if job.disallow_concurrent_execution
        && ledger::has_active_for_job(conn, sched, &job.key)?
    {
        TriggerState::Blocked
    } else {
        TriggerState::Waiting
    };
    Ok(stored)
}

/// Plain insert. Fails on a duplicate key.
pub(crate) fn insert_trigger(conn: &Connection, sched: &str, t: &TriggerDefinition) -> Result<()> {
    insert_trigger_with(conn, sched, t, "INSERT")?;
    Ok(())
}

/// Insert unless the key exists. Returns whether a row was written.
pub(crate) fn insert_trigger_if_absent(
    conn: &Connection,
    sched: &str,
    t: &TriggerDefinition,
) -> Result<bool> {
    Ok(insert_trigger_with(conn, sched, t, "INSERT OR IGNORE")? > 0)
}

fn insert_trigger_with(
    conn: &Connection,
    sched: &str,
    t: &TriggerDefinition,
    verb: &str,
) -> Result<usize> {
    let schedule = serde_json::to_string(&t.schedule)?;
    let sql = format!(
        "{verb} INTO triggers
         (sched_name, {TRIGGER_COLUMNS})
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)"
    );
    Ok(conn.execute(
        &sql,
        rusqlite::params![
            sched,
            t.key.group,
            t.key.name,
            t.job_key.group,
            t.job_key.name,
            schedule,
            t.misfire_instruction.as_str(),
            t.priority,
            to_millis(t.start_time),
            opt_millis(t.end_time),
            opt_millis(t.next_fire_time),
            opt_millis(t.previous_fire_time),
            t.times_triggered,
            t.state.as_str(),
            opt_millis(t.recovering_fire_time),
        ],
    )?)
}

/// Persist the schedule-derived fields. Never touches `state`.
pub(crate) fn update_fire_times(conn: &Connection, sched: &str, t: &TriggerDefinition) -> Result<()> {
    conn.execute(
        "UPDATE triggers SET start_time = ?4, next_fire_time = ?5,
                previous_fire_time = ?6, times_triggered = ?7
         WHERE sched_name = ?1 AND trigger_group = ?2 AND trigger_name = ?3",
        rusqlite::params![
            sched,
            t.key.group,
            t.key.name,
            to_millis(t.start_time),
            opt_millis(t.next_fire_time),
            opt_millis(t.previous_fire_time),
            t.times_triggered,
        ],
    )?;
    Ok(())
}

fn delete_trigger_row(conn: &Connection, sched: &str, key: &TriggerKey) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM triggers WHERE sched_name = ?1 AND trigger_group = ?2 AND trigger_name = ?3",
        rusqlite::params![sched, key.group, key.name],
    )?;
    Ok(n > 0)
}

/// Delete a trigger with its ledger rows, then the job if it is non-durable
/// and now trigger-less, otherwise unblock the job if it went idle.
pub(crate) fn remove_trigger_cascading(
    conn: &Connection,
    sched: &str,
    trigger: &TriggerDefinition,
) -> Result<()> {
    ledger::remove_for_trigger(conn, sched, &trigger.key)?;
    delete_trigger_row(conn, sched, &trigger.key)?;
    if let Some(job) = load_job(conn, sched, &trigger.job_key)? {
        if !job.durable && triggers_of_job(conn, sched, &job.key)?.is_empty() {
            ledger::remove_for_job(conn, sched, &job.key)?;
            delete_job_row(conn, sched, &job.key)?;
            debug!(job = %job.key, "non-durable job removed with its last trigger");
        } else {
            unblock_job_if_idle(conn, sched, &job.key)?;
        }
    }
    Ok(())
}

/// Compare-and-set a trigger's state. Illegal moves are a `ConsistencyViolation`;
/// returns false when the trigger was no longer in `from`.
pub(crate) fn transition(
    conn: &Connection,
    sched: &str,
    key: &TriggerKey,
    from: TriggerState,
    to: TriggerState,
) -> Result<bool> {
    if from != to && !from.can_transition_to(to) {
        return Err(SchedulerError::ConsistencyViolation(format!(
            "illegal transition {from} -> {to} for trigger {key}"
        )));
    }
    let n = conn.execute(
        "UPDATE triggers SET state = ?5
         WHERE sched_name = ?1 AND trigger_group = ?2 AND trigger_name = ?3 AND state = ?4",
        rusqlite::params![sched, key.group, key.name, from.as_str(), to.as_str()],
    )?;
    Ok(n > 0)
}

/// Move a trigger to `to` from whatever state it is in, when that move is legal.
/// Illegal moves are logged and skipped. Returns whether the state changed.
pub(crate) fn move_to_if_legal(
    conn: &Connection,
    sched: &str,
    key: &TriggerKey,
    to: TriggerState,
) -> Result<bool> {
    let Some(from) = current_state(conn, sched, key)? else {
        return Ok(false);
    };
    if from == to {
        return Ok(false);
    }
    if !from.can_transition_to(to) {
        warn!(trigger = %key, %from, %to, "skipping illegal trigger transition");
        return Ok(false);
    }
    transition(conn, sched, key, from, to)
}

/// Block the job's other idle triggers while one of its firings is active.
pub(crate) fn block_job_triggers(
    conn: &Connection,
    sched: &str,
    job: &JobKey,
    except: &TriggerKey,
) -> Result<usize> {
    let mut blocked = 0;
    for t in triggers_of_job(conn, sched, job)? {
        if t.key == *except {
            continue;
        }
        if matches!(t.state, TriggerState::Waiting | TriggerState::Paused) {
            transition(conn, sched, &t.key, t.state, t.state.blocked())?;
            blocked += 1;
        }
    }
    Ok(blocked)
}

/// Unblock the job's triggers if no ledger row for it remains.
pub(crate) fn unblock_job_if_idle(conn: &Connection, sched: &str, job: &JobKey) -> Result<usize> {
    if ledger::has_active_for_job(conn, sched, job)? {
        return Ok(0);
    }
    let mut unblocked = 0;
    for (from, to) in [
        (TriggerState::Blocked, TriggerState::Waiting),
        (TriggerState::PausedBlocked, TriggerState::Paused),
    ] {
        unblocked += conn.execute(
            "UPDATE triggers SET state = ?5
             WHERE sched_name = ?1 AND job_group = ?2 AND job_name = ?3 AND state = ?4",
            rusqlite::params![sched, job.group, job.name, from.as_str(), to.as_str()],
        )?;
    }
    if unblocked > 0 {
        debug!(job = %job, unblocked, "job triggers unblocked");
    }
    Ok(unblocked)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        db::init_db,
        types::{MisfireInstruction, Schedule},
    };

    fn store() -> JobStore {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        JobStore::new(
            Arc::new(Mutex::new(conn)),
            "test",
            "node-1",
            std::time::Duration::from_secs(1),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap()
    }

    fn every_minute(name: &str, job: &JobKey) -> TriggerDefinition {
        TriggerDefinition::new(
            TriggerKey::named(name),
            job.clone(),
            Schedule::Interval {
                every_ms: 60_000,
                repeat_count: None,
            },
            t0(),
        )
    }

    #[test]
    fn stores_job_and_trigger_with_first_fire_time() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("report"), "log");
        let stored = s
            .store_job_and_trigger(&job, &every_minute("t", &job.key))
            .unwrap();
        assert_eq!(stored.state, TriggerState::Waiting);
        assert_eq!(stored.next_fire_time, Some(t0()));

        let back = s.retrieve_trigger(&stored.key).unwrap().unwrap();
        assert_eq!(back, stored);
        assert_eq!(s.retrieve_job(&job.key).unwrap().unwrap(), job);
    }

    #[test]
    fn duplicate_and_missing_keys_are_reported() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("report"), "log");
        s.store_job_and_trigger(&job, &every_minute("t", &job.key)).unwrap();

        let err = s.store_trigger(&every_minute("t", &job.key), false).unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
        s.store_trigger(&every_minute("t", &job.key), true).unwrap();

        let orphan = every_minute("x", &JobKey::named("missing"));
        assert_eq!(s.store_trigger(&orphan, false).unwrap_err().code(), "NOT_FOUND");

        assert!(!s.remove_trigger(&TriggerKey::named("nope")).unwrap());
        assert!(!s.pause_trigger(&TriggerKey::named("nope")).unwrap());
        assert!(!s.remove_job(&JobKey::named("nope")).unwrap());
    }

    #[test]
    fn non_durable_job_needs_a_trigger() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("lonely"), "log");
        assert_eq!(s.store_job(&job, false).unwrap_err().code(), "INVALID_JOB");

        let durable = JobDefinition {
            durable: true,
            ..job
        };
        s.store_job(&durable, false).unwrap();
        assert_eq!(s.store_job(&durable, false).unwrap_err().code(), "ALREADY_EXISTS");
        s.store_job(&durable, true).unwrap();
    }

    #[test]
    fn trigger_that_never_fires_is_rejected() {
        let s = store();
        let job = JobDefinition {
            durable: true,
            ..JobDefinition::new(JobKey::named("j"), "log")
        };
        s.store_job(&job, false).unwrap();
        let mut t = TriggerDefinition::new(
            TriggerKey::named("late"),
            job.key.clone(),
            Schedule::Once { at: t0() },
            t0(),
        );
        t.end_time = Some(t0() - Duration::seconds(1));
        assert_eq!(s.store_trigger(&t, false).unwrap_err().code(), "INVALID_SCHEDULE");
    }

    #[test]
    fn removing_last_trigger_removes_non_durable_job_and_ledger_rows() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("j"), "log");
        let t = s.store_job_and_trigger(&job, &every_minute("t", &job.key)).unwrap();
        {
            let conn = s.conn().unwrap();
            ledger::record_firing(&conn, "test", &t, &job, "node-1", t0(), false).unwrap();
        }
        assert!(s.remove_trigger(&t.key).unwrap());
        assert!(s.retrieve_job(&job.key).unwrap().is_none());
        assert!(s.fired_records().unwrap().is_empty());
    }

    #[test]
    fn removing_job_cascades() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("j"), "log");
        s.store_job_and_trigger(&job, &every_minute("a", &job.key)).unwrap();
        s.store_trigger(&every_minute("b", &job.key), false).unwrap();
        assert!(s.remove_job(&job.key).unwrap());
        assert!(s.list_triggers().unwrap().is_empty());
        assert!(s.trigger_state(&TriggerKey::named("a")).unwrap().is_none());
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("j"), "log");
        let t = s.store_job_and_trigger(&job, &every_minute("t", &job.key)).unwrap();

        assert!(s.pause_job(&job.key).unwrap());
        assert_eq!(s.trigger_state(&t.key).unwrap(), Some(TriggerState::Paused));
        // resumed before the fire time: no misfire handling
        assert!(s.resume_trigger(&t.key, t0() - Duration::seconds(5)).unwrap());
        assert_eq!(s.trigger_state(&t.key).unwrap(), Some(TriggerState::Waiting));
        assert_eq!(s.retrieve_trigger(&t.key).unwrap().unwrap().next_fire_time, Some(t0()));
    }

    #[test]
    fn resume_applies_misfire_policy() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("j"), "log");
        let mut t = every_minute("t", &job.key);
        t.misfire_instruction = MisfireInstruction::DoNothing;
        s.store_job_and_trigger(&job, &t).unwrap();
        s.pause_trigger(&t.key).unwrap();

        let later = t0() + Duration::seconds(150);
        s.resume_trigger(&t.key, later).unwrap();
        let back = s.retrieve_trigger(&t.key).unwrap().unwrap();
        assert_eq!(back.state, TriggerState::Waiting);
        assert_eq!(back.next_fire_time, Some(t0() + Duration::seconds(180)));
    }

    #[test]
    fn new_trigger_of_busy_non_concurrent_job_starts_blocked() {
        let s = store();
        let job = JobDefinition {
            disallow_concurrent_execution: true,
            ..JobDefinition::new(JobKey::named("j"), "log")
        };
        let first = s.store_job_and_trigger(&job, &every_minute("a", &job.key)).unwrap();
        {
            let conn = s.conn().unwrap();
            ledger::record_firing(&conn, "test", &first, &job, "node-1", t0(), false).unwrap();
        }
        let second = s.store_trigger(&every_minute("b", &job.key), false).unwrap();
        assert_eq!(second.state, TriggerState::Blocked);
    }

    #[test]
    fn reset_from_error_only_touches_error_triggers() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("j"), "log");
        let t = s.store_job_and_trigger(&job, &every_minute("t", &job.key)).unwrap();
        {
            let conn = s.conn().unwrap();
            transition(&conn, "test", &t.key, TriggerState::Waiting, TriggerState::Error).unwrap();
            let err = transition(&conn, "test", &t.key, TriggerState::Error, TriggerState::Blocked)
                .unwrap_err();
            assert_eq!(err.code(), "CONSISTENCY_VIOLATION");
        }
        assert!(s.reset_trigger_from_error(&t.key).unwrap());
        assert_eq!(s.trigger_state(&t.key).unwrap(), Some(TriggerState::Waiting));
    }

    #[test]
    fn replace_trigger_requires_same_job() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("j"), "log");
        let t = s.store_job_and_trigger(&job, &every_minute("t", &job.key)).unwrap();
        let other = every_minute("u", &JobKey::named("elsewhere"));
        assert_eq!(s.replace_trigger(&t.key, &other).unwrap_err().code(), "INVALID_JOB");

        let replacement = every_minute("u", &job.key);
        let stored = s.replace_trigger(&t.key, &replacement).unwrap().unwrap();
        assert_eq!(stored.key, TriggerKey::named("u"));
        assert!(s.retrieve_trigger(&t.key).unwrap().is_none());
        assert!(s.replace_trigger(&t.key, &replacement).unwrap().is_none());
        // the job survived the swap
        assert!(s.retrieve_job(&job.key).unwrap().is_some());
    }

    #[test]
    fn clear_empties_only_this_scheduler() {
        let s = store();
        let job = JobDefinition::new(JobKey::named("j"), "log");
        s.store_job_and_trigger(&job, &every_minute("t", &job.key)).unwrap();
        s.clear().unwrap();
        assert!(s.list_jobs().unwrap().is_empty());
        assert!(s.list_triggers().unwrap().is_empty());
    }
}
