//! The fired-trigger ledger: one row per acquired or executing firing.
//!
//! These functions take the caller's connection or transaction so every
//! ledger write commits together with the trigger transition it accompanies.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::{
    db::{enum_col, time_col, to_millis},
    error::Result,
    state::FiredState,
    types::{FiredTriggerRecord, JobDefinition, JobKey, TriggerDefinition, TriggerKey},
};

const RECORD_COLUMNS: &str = "entry_id, trigger_group, trigger_name, job_group, job_name,
     instance_id, fired_time, sched_time, priority, state, recovering,
     disallow_concurrent, requests_recovery";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<FiredTriggerRecord> {
    Ok(FiredTriggerRecord {
        entry_id: row.get(0)?,
        trigger_key: TriggerKey::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        job_key: JobKey::new(row.get::<_, String>(3)?, row.get::<_, String>(4)?),
        instance_id: row.get(5)?,
        fired_time: time_col(row, 6)?,
        scheduled_fire_time: time_col(row, 7)?,
        priority: row.get(8)?,
        state: enum_col(row, 9)?,
        recovering: row.get(10)?,
        disallow_concurrent: row.get(11)?,
        requests_recovery: row.get(12)?,
    })
}

/// Write an `ACQUIRED` row for `trigger`, scheduled at its current next fire time.
pub fn record_firing(
    conn: &Connection,
    sched_name: &str,
    trigger: &TriggerDefinition,
    job: &JobDefinition,
    instance_id: &str,
    fire_time: DateTime<Utc>,
    recovering: bool,
) -> Result<FiredTriggerRecord> {
    let record = FiredTriggerRecord {
        entry_id: Uuid::now_v7().to_string(),
        trigger_key: trigger.key.clone(),
        job_key: job.key.clone(),
        instance_id: instance_id.to_string(),
        fired_time: fire_time,
        scheduled_fire_time: trigger.next_fire_time.unwrap_or(fire_time),
        priority: trigger.priority,
        state: FiredState::Acquired,
        recovering,
        disallow_concurrent: job.disallow_concurrent_execution,
        requests_recovery: job.requests_recovery,
    };
    conn.execute(
        "INSERT INTO fired_triggers
         (sched_name, entry_id, trigger_group, trigger_name, job_group, job_name,
          instance_id, fired_time, sched_time, priority, state, recovering,
          disallow_concurrent, requests_recovery)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        rusqlite::params![
            sched_name,
            record.entry_id,
            record.trigger_key.group,
            record.trigger_key.name,
            record.job_key.group,
            record.job_key.name,
            record.instance_id,
            to_millis(record.fired_time),
            to_millis(record.scheduled_fire_time),
            record.priority,
            record.state.as_str(),
            record.recovering,
            record.disallow_concurrent,
            record.requests_recovery,
        ],
    )?;
    Ok(record)
}

/// Move a row from `ACQUIRED` to `EXECUTING`. Returns false if the row is gone.
pub fn mark_executing(
    conn: &Connection,
    sched_name: &str,
    entry_id: &str,
    fire_time: DateTime<Utc>,
) -> Result<bool> {
    let n = conn.execute(
        "UPDATE fired_triggers SET state = ?3, fired_time = ?4
         WHERE sched_name = ?1 AND entry_id = ?2",
        rusqlite::params![
            sched_name,
            entry_id,
            FiredState::Executing.as_str(),
            to_millis(fire_time)
        ],
    )?;
    Ok(n > 0)
}

pub fn get(conn: &Connection, sched_name: &str, entry_id: &str) -> Result<Option<FiredTriggerRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM fired_triggers WHERE sched_name = ?1 AND entry_id = ?2"
    );
    Ok(conn
        .query_row(&sql, rusqlite::params![sched_name, entry_id], row_to_record)
        .optional()?)
}

/// Delete one row. Used by both completion and graceful release.
pub fn remove(conn: &Connection, sched_name: &str, entry_id: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM fired_triggers WHERE sched_name = ?1 AND entry_id = ?2",
        rusqlite::params![sched_name, entry_id],
    )?;
    Ok(n > 0)
}

pub fn remove_for_trigger(conn: &Connection, sched_name: &str, key: &TriggerKey) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM fired_triggers
         WHERE sched_name = ?1 AND trigger_group = ?2 AND trigger_name = ?3",
        rusqlite::params![sched_name, key.group, key.name],
    )?)
}

pub fn remove_for_job(conn: &Connection, sched_name: &str, key: &JobKey) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM fired_triggers
         WHERE sched_name = ?1 AND job_group = ?2 AND job_name = ?3",
        rusqlite::params![sched_name, key.group, key.name],
    )?)
}

/// True while any instance holds an acquired or executing firing of the job.
pub fn has_active_for_job(conn: &Connection, sched_name: &str, key: &JobKey) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM fired_triggers
         WHERE sched_name = ?1 AND job_group = ?2 AND job_name = ?3",
        rusqlite::params![sched_name, key.group, key.name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn has_acquired_for_trigger(conn: &Connection, sched_name: &str, key: &TriggerKey) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM fired_triggers
         WHERE sched_name = ?1 AND trigger_group = ?2 AND trigger_name = ?3 AND state = ?4",
        rusqlite::params![sched_name, key.group, key.name, FiredState::Acquired.as_str()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Rows written by one instance, optionally filtered by state, oldest first.
pub fn list_for_instance(
    conn: &Connection,
    sched_name: &str,
    instance_id: &str,
    state: Option<FiredState>,
) -> Result<Vec<FiredTriggerRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM fired_triggers
         WHERE sched_name = ?1 AND instance_id = ?2 AND (?3 IS NULL OR state = ?3)
         ORDER BY fired_time, entry_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params![sched_name, instance_id, state.map(|s| s.as_str())],
        row_to_record,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_all(conn: &Connection, sched_name: &str) -> Result<Vec<FiredTriggerRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM fired_triggers
         WHERE sched_name = ?1 ORDER BY fired_time, entry_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([sched_name], row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Rows whose instance is not in `live_instances`.
pub fn list_orphaned(
    conn: &Connection,
    sched_name: &str,
    live_instances: &HashSet<String>,
) -> Result<Vec<FiredTriggerRecord>> {
    Ok(list_all(conn, sched_name)?
        .into_iter()
        .filter(|r| !live_instances.contains(&r.instance_id))
        .collect())
}

/// Instance ids that currently own at least one row.
pub fn distinct_instances(conn: &Connection, sched_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT instance_id FROM fired_triggers WHERE sched_name = ?1 ORDER BY instance_id",
    )?;
    let rows = stmt.query_map([sched_name], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
