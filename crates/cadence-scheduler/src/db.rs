use std::{path::Path, str::FromStr, time::Duration};

use cadence_core::DatabaseConfig;
use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tracing::info;

use crate::error::{Result, SchedulerError};

/// Tables every store operation relies on.
pub const TABLES: [&str; 5] = ["jobs", "triggers", "fired_triggers", "locks", "scheduler_state"];

/// Open a connection with the pragmas every store connection needs.
///
/// WAL lets readers proceed while another instance holds the write lock;
/// the busy timeout makes `BEGIN IMMEDIATE` wait instead of failing fast.
pub fn open_connection(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Open the configured database and make sure the schema is usable.
pub fn open_database(config: &DatabaseConfig) -> Result<Connection> {
    if let Some(parent) = Path::new(&config.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::SchemaMissing(format!("{}: {e}", parent.display()))
            })?;
        }
    }
    let conn = open_connection(&config.path, config.busy_timeout())?;
    if config.create_schema {
        init_db(&conn)?;
    } else {
        verify_schema(&conn)?;
    }
    info!(path = %config.path, "database ready");
    Ok(conn)
}

/// Initialise the scheduler schema in `conn`.
///
/// Safe to call on every startup. Every table is keyed by `sched_name` so
/// several logical schedulers can share one file. Timestamps are epoch
/// milliseconds. There are no foreign keys: cascades run explicitly inside
/// the transaction of the operation that causes them.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            sched_name          TEXT    NOT NULL,
            job_group           TEXT    NOT NULL,
            job_name            TEXT    NOT NULL,
            job_type            TEXT    NOT NULL,
            description         TEXT,
            durable             INTEGER NOT NULL DEFAULT 0,
            disallow_concurrent INTEGER NOT NULL DEFAULT 0,
            requests_recovery   INTEGER NOT NULL DEFAULT 0,
            job_data            TEXT    NOT NULL DEFAULT 'null',  -- JSON
            PRIMARY KEY (sched_name, job_group, job_name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS triggers (
            sched_name           TEXT    NOT NULL,
            trigger_group        TEXT    NOT NULL,
            trigger_name         TEXT    NOT NULL,
            job_group            TEXT    NOT NULL,
            job_name             TEXT    NOT NULL,
            schedule             TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            misfire_instruction  TEXT    NOT NULL,
            priority             INTEGER NOT NULL,
            start_time           INTEGER NOT NULL,
            end_time             INTEGER,
            next_fire_time       INTEGER,            -- NULL once exhausted
            previous_fire_time   INTEGER,
            times_triggered      INTEGER NOT NULL DEFAULT 0,
            state                TEXT    NOT NULL,
            recovering_fire_time INTEGER,
            PRIMARY KEY (sched_name, trigger_group, trigger_name)
        ) STRICT;

        -- Acquisition: WHERE state = 'WAITING' AND next_fire_time <= ? ORDER BY next_fire_time
        CREATE INDEX IF NOT EXISTS idx_triggers_due
            ON triggers (sched_name, state, next_fire_time);
        CREATE INDEX IF NOT EXISTS idx_triggers_job
            ON triggers (sched_name, job_group, job_name);

        CREATE TABLE IF NOT EXISTS fired_triggers (
            sched_name          TEXT    NOT NULL,
            entry_id            TEXT    NOT NULL,
            trigger_group       TEXT    NOT NULL,
            trigger_name        TEXT    NOT NULL,
            job_group           TEXT    NOT NULL,
            job_name            TEXT    NOT NULL,
            instance_id         TEXT    NOT NULL,
            fired_time          INTEGER NOT NULL,
            sched_time          INTEGER NOT NULL,
            priority            INTEGER NOT NULL,
            state               TEXT    NOT NULL,
            recovering          INTEGER NOT NULL DEFAULT 0,
            disallow_concurrent INTEGER NOT NULL DEFAULT 0,
            requests_recovery   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (sched_name, entry_id)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_fired_instance
            ON fired_triggers (sched_name, instance_id);
        CREATE INDEX IF NOT EXISTS idx_fired_job
            ON fired_triggers (sched_name, job_group, job_name);
        CREATE INDEX IF NOT EXISTS idx_fired_trigger
            ON fired_triggers (sched_name, trigger_group, trigger_name);

        CREATE TABLE IF NOT EXISTS locks (
            sched_name TEXT    NOT NULL,
            lock_name  TEXT    NOT NULL,
            owner      TEXT,
            token      TEXT,
            expires_at INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (sched_name, lock_name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS scheduler_state (
            sched_name          TEXT    NOT NULL,
            instance_id         TEXT    NOT NULL,
            last_checkin        INTEGER NOT NULL,
            checkin_interval_ms INTEGER NOT NULL,
            PRIMARY KEY (sched_name, instance_id)
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Fail with `SchemaMissing` if any required table is absent.
pub fn verify_schema(conn: &Connection) -> Result<()> {
    for table in TABLES {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Err(SchedulerError::SchemaMissing(table.to_string()));
        }
    }
    Ok(())
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn opt_millis(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(to_millis)
}

/// Read an epoch-millisecond column.
pub(crate) fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

pub(crate) fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        None => Ok(None),
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
    }
}

/// Read a text column holding one of the crate's `as_str` enums.
pub(crate) fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
