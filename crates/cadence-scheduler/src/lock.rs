//! Named cluster locks backed by lease rows in the shared database.
//!
//! A lock is a `locks` row holding the owner, a per-acquisition token and a
//! lease expiry. It can be taken when unowned or when the lease has run out,
//! so a crashed holder is eventually replaced. Store operations that need a
//! lock take the [`LockGuard`] and call [`LockGuard::verify`] inside their own
//! transaction: a holder whose lease was taken over fails with `LockLost`
//! before it can commit anything.

use std::{
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    /// Trigger acquisition and firing.
    TriggerAccess,
    /// Misfire scans and crash recovery.
    MisfireAccess,
    /// Instance check-in and completion reporting.
    StateAccess,
}

impl LockName {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockName::TriggerAccess => "TRIGGER_ACCESS",
            LockName::MisfireAccess => "MISFIRE_ACCESS",
            LockName::StateAccess => "STATE_ACCESS",
        }
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock manager for one scheduler instance.
#[derive(Clone)]
pub struct ClusterLock {
    conn: Arc<Mutex<Connection>>,
    sched_name: String,
    owner: String,
    lease: Duration,
    retry: Duration,
}

impl ClusterLock {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        sched_name: impl Into<String>,
        owner: impl Into<String>,
        lease: Duration,
        retry: Duration,
    ) -> Self {
        Self {
            conn,
            sched_name: sched_name.into(),
            owner: owner.into(),
            lease,
            retry,
        }
    }

    /// Take the lock if it is free or its lease has expired.
    pub fn try_acquire(&self, name: LockName) -> Result<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let expires_at = now + self.lease.as_millis() as i64;

        let conn = self.conn.lock().map_err(|_| SchedulerError::Poisoned)?;
        conn.execute(
            "INSERT OR IGNORE INTO locks (sched_name, lock_name, expires_at) VALUES (?1, ?2, 0)",
            rusqlite::params![self.sched_name, name.as_str()],
        )?;
        let taken = conn.execute(
            "UPDATE locks SET owner = ?3, token = ?4, expires_at = ?5
             WHERE sched_name = ?1 AND lock_name = ?2
               AND (token IS NULL OR expires_at < ?6)",
            rusqlite::params![self.sched_name, name.as_str(), self.owner, token, expires_at, now],
        )?;
        drop(conn);

        if taken == 0 {
            return Ok(None);
        }
        debug!(lock = %name, owner = %self.owner, "cluster lock acquired");
        Ok(Some(LockGuard {
            conn: Arc::clone(&self.conn),
            sched_name: self.sched_name.clone(),
            name,
            token,
            lease: self.lease,
        }))
    }

    /// Retry [`ClusterLock::try_acquire`] until it succeeds or `timeout` elapses.
    pub async fn acquire(&self, name: LockName, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(name)? {
                return Ok(guard);
            }
            if started.elapsed() >= timeout {
                return Err(SchedulerError::LockTimeout {
                    lock: name.as_str(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.retry).await;
        }
    }
}

/// Proof of holding a named lock. Released on drop.
///
/// The guard locks the store connection when dropped, so it must never be
/// dropped while that connection's mutex is held by the same thread.
#[derive(Debug)]
pub struct LockGuard {
    conn: Arc<Mutex<Connection>>,
    sched_name: String,
    name: LockName,
    token: String,
    lease: Duration,
}

impl LockGuard {
    pub fn name(&self) -> LockName {
        self.name
    }

    /// Confirm the lease is still ours and extend it.
    ///
    /// Called with the connection (usually an open transaction) of the
    /// operation the lock protects, so the check and the work commit together.
    pub fn verify(&self, conn: &Connection, expected: LockName) -> Result<()> {
        if self.name != expected {
            return Err(SchedulerError::ConsistencyViolation(format!(
                "operation requires {expected} but {} is held",
                self.name
            )));
        }
        let now = Utc::now().timestamp_millis();
        let renewed = conn.execute(
            "UPDATE locks SET expires_at = ?4
             WHERE sched_name = ?1 AND lock_name = ?2 AND token = ?3 AND expires_at >= ?5",
            rusqlite::params![
                self.sched_name,
                self.name.as_str(),
                self.token,
                now + self.lease.as_millis() as i64,
                now
            ],
        )?;
        if renewed == 0 {
            return Err(SchedulerError::LockLost {
                lock: self.name.as_str(),
            });
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let conn = match self.conn.lock() {
            Ok(conn) => conn,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Matching on the token leaves a lock taken over by a peer untouched.
        let released = conn.execute(
            "UPDATE locks SET owner = NULL, token = NULL, expires_at = 0
             WHERE sched_name = ?1 AND lock_name = ?2 AND token = ?3",
            rusqlite::params![self.sched_name, self.name.as_str(), self.token],
        );
        match released {
            Ok(0) => warn!(lock = %self.name, "lease expired before release"),
            Ok(_) => debug!(lock = %self.name, "cluster lock released"),
            Err(e) => warn!(lock = %self.name, error = %e, "failed to release cluster lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, open_connection};

    fn locks_on(path: &std::path::Path, owner: &str, lease_ms: u64) -> ClusterLock {
        let conn = open_connection(path, Duration::from_secs(5)).unwrap();
        init_db(&conn).unwrap();
        ClusterLock::new(
            Arc::new(Mutex::new(conn)),
            "test",
            owner,
            Duration::from_millis(lease_ms),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        let a = locks_on(&path, "a", 30_000);
        let b = locks_on(&path, "b", 30_000);

        let guard = a.try_acquire(LockName::TriggerAccess).unwrap().unwrap();
        assert!(b.try_acquire(LockName::TriggerAccess).unwrap().is_none());
        // other names are independent
        assert!(b.try_acquire(LockName::StateAccess).unwrap().is_some());

        drop(guard);
        assert!(b.try_acquire(LockName::TriggerAccess).unwrap().is_some());
    }

    #[test]
    fn expired_lease_is_taken_over_and_fences_the_old_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        let a = locks_on(&path, "a", 20);
        let b = locks_on(&path, "b", 30_000);

        let stale = a.try_acquire(LockName::TriggerAccess).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let fresh = b.try_acquire(LockName::TriggerAccess).unwrap().unwrap();

        {
            let conn = a.conn.lock().unwrap();
            let err = stale.verify(&conn, LockName::TriggerAccess).unwrap_err();
            assert_eq!(err.code(), "LOCK_LOST");
        }
        // dropping the stale guard must not release the new holder's lease
        drop(stale);
        assert!(a.try_acquire(LockName::TriggerAccess).unwrap().is_none());

        let conn = b.conn.lock().unwrap();
        fresh.verify(&conn, LockName::TriggerAccess).unwrap();
        drop(conn);
    }

    #[test]
    fn verify_rejects_the_wrong_lock() {
        let dir = tempfile::tempdir().unwrap();
        let a = locks_on(&dir.path().join("locks.db"), "a", 30_000);
        let guard = a.try_acquire(LockName::StateAccess).unwrap().unwrap();
        let conn = a.conn.lock().unwrap();
        let err = guard.verify(&conn, LockName::TriggerAccess).unwrap_err();
        assert_eq!(err.code(), "CONSISTENCY_VIOLATION");
        drop(conn);
    }

    #[tokio::test]
    async fn acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        let a = locks_on(&path, "a", 30_000);
        let b = locks_on(&path, "b", 30_000);

        let _held = a.acquire(LockName::MisfireAccess, Duration::from_millis(100)).await.unwrap();
        let err = b
            .acquire(LockName::MisfireAccess, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::LockTimeout { lock: "MISFIRE_ACCESS", .. }));
    }
}
