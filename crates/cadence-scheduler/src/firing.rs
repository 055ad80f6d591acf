//! The firing protocol: acquire due triggers, fire them, report completion.
//!
//! Each step is one transaction. The lock-requiring steps take the matching
//! [`LockGuard`] and verify its lease inside that transaction.

use chrono::{DateTime, Duration, Utc};
use rusqlite::TransactionBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::Result,
    ledger,
    lock::{LockGuard, LockName},
    repository::{
        block_job_triggers, load_job, load_trigger, move_to_if_legal, remove_trigger_cascading,
        row_to_trigger, transition, triggers_of_job, unblock_job_if_idle, update_fire_times,
        JobStore, TRIGGER_COLUMNS,
    },
    schedule::{advance_after_fire, apply_misfire, is_misfired},
    state::{FiredState, TriggerState},
    types::{AcquiredTrigger, CompletionInstruction, TriggerFiredBundle},
};

/// Candidates fetched per requested slot; extra rows absorb misfired or
/// blocked candidates that end up not being acquired.
const CANDIDATE_FACTOR: usize = 3;

impl JobStore {
    /// Claim up to `max_count` waiting triggers due by `now + lookahead`.
    ///
    /// Misfire policy is applied before the concurrency check, so a misfired
    /// trigger is rescheduled even when its job is busy.
    #[instrument(skip(self, guard), fields(max_count))]
    pub fn acquire_next_triggers(
        &self,
        guard: &LockGuard,
        now: DateTime<Utc>,
        max_count: usize,
        lookahead: Duration,
    ) -> Result<Vec<AcquiredTrigger>> {
        let sched = self.sched_name().to_string();
        let horizon = now + lookahead;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        guard.verify(&tx, LockName::TriggerAccess)?;

        let candidates = {
            let sql = format!(
                "SELECT {TRIGGER_COLUMNS} FROM triggers
                 WHERE sched_name = ?1 AND state = ?2
                   AND next_fire_time IS NOT NULL AND next_fire_time <= ?3
                 ORDER BY next_fire_time, priority DESC, trigger_group, trigger_name
                 LIMIT ?4"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![
                    sched,
                    TriggerState::Waiting.as_str(),
                    horizon.timestamp_millis(),
                    (max_count.max(1) * CANDIDATE_FACTOR) as i64
                ],
                row_to_trigger,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut acquired = Vec::new();
        for mut trigger in candidates {
            if acquired.len() >= max_count {
                break;
            }
            let Some(job) = load_job(&tx, &sched, &trigger.job_key)? else {
                error!(trigger = %trigger.key, job = %trigger.job_key, "trigger references a missing job");
                transition(&tx, &sched, &trigger.key, TriggerState::Waiting, TriggerState::Error)?;
                continue;
            };

            if is_misfired(&trigger, now, self.misfire_threshold()) {
                let next = apply_misfire(&mut trigger, now);
                update_fire_times(&tx, &sched, &trigger)?;
                match next {
                    None => {
                        info!(trigger = %trigger.key, "misfired trigger has no fire time left");
                        transition(&tx, &sched, &trigger.key, TriggerState::Waiting, TriggerState::Complete)?;
                        continue;
                    }
                    Some(next) if next > horizon => {
                        debug!(trigger = %trigger.key, next_fire_time = %next, "misfired trigger rescheduled");
                        continue;
                    }
                    Some(_) => {}
                }
            }

            if job.disallow_concurrent_execution && ledger::has_active_for_job(&tx, &sched, &job.key)? {
                debug!(trigger = %trigger.key, job = %job.key, "job busy, trigger blocked");
                transition(&tx, &sched, &trigger.key, TriggerState::Waiting, TriggerState::Blocked)?;
                continue;
            }

            if !transition(&tx, &sched, &trigger.key, TriggerState::Waiting, TriggerState::Acquired)? {
                continue;
            }
            trigger.state = TriggerState::Acquired;
            let record = ledger::record_firing(
                &tx,
                &sched,
                &trigger,
                &job,
                self.instance_id(),
                now,
                trigger.is_recovery(),
            )?;
            acquired.push(AcquiredTrigger { trigger, record });
        }

        tx.commit()?;
        if !acquired.is_empty() {
            debug!(count = acquired.len(), "triggers acquired");
        }
        Ok(acquired)
    }

    /// Start the firings of previously acquired triggers.
    ///
    /// Returns one entry per input; `None` means the firing was abandoned
    /// because the trigger was removed, paused or otherwise changed after
    /// acquisition. Abandoned ledger rows are deleted.
    #[instrument(skip(self, guard, acquired), fields(count = acquired.len()))]
    pub fn triggers_fired(
        &self,
        guard: &LockGuard,
        acquired: &[AcquiredTrigger],
        now: DateTime<Utc>,
    ) -> Result<Vec<Option<TriggerFiredBundle>>> {
        let sched = self.sched_name().to_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        guard.verify(&tx, LockName::TriggerAccess)?;

        let mut results = Vec::with_capacity(acquired.len());
        for a in acquired {
            let record = &a.record;
            let current = load_trigger(&tx, &sched, &record.trigger_key)?;
            let mut trigger = match current {
                Some(t) if t.state == TriggerState::Acquired => t,
                other => {
                    debug!(
                        trigger = %record.trigger_key,
                        state = ?other.map(|t| t.state),
                        "acquired trigger changed before firing"
                    );
                    ledger::remove(&tx, &sched, &record.entry_id)?;
                    unblock_job_if_idle(&tx, &sched, &record.job_key)?;
                    results.push(None);
                    continue;
                }
            };
            let Some(job) = load_job(&tx, &sched, &trigger.job_key)? else {
                error!(trigger = %trigger.key, "job vanished before firing");
                ledger::remove(&tx, &sched, &record.entry_id)?;
                transition(&tx, &sched, &trigger.key, TriggerState::Acquired, TriggerState::Error)?;
                results.push(None);
                continue;
            };
            if !ledger::mark_executing(&tx, &sched, &record.entry_id, now)? {
                warn!(trigger = %trigger.key, entry_id = %record.entry_id, "ledger row vanished before firing");
                results.push(None);
                continue;
            }

            let scheduled = trigger.next_fire_time.unwrap_or(record.scheduled_fire_time);
            let previous = trigger.previous_fire_time;
            advance_after_fire(&mut trigger);
            update_fire_times(&tx, &sched, &trigger)?;

            let next_state = if trigger.next_fire_time.is_none() {
                TriggerState::Executing
            } else if job.disallow_concurrent_execution {
                TriggerState::Blocked
            } else {
                TriggerState::Waiting
            };
            transition(&tx, &sched, &trigger.key, TriggerState::Acquired, next_state)?;
            trigger.state = next_state;
            if job.disallow_concurrent_execution {
                block_job_triggers(&tx, &sched, &job.key, &trigger.key)?;
            }

            let mut record = record.clone();
            record.state = FiredState::Executing;
            record.fired_time = now;
            let recovering = record.recovering || trigger.is_recovery();
            results.push(Some(TriggerFiredBundle {
                scheduled_fire_time: trigger.recovering_fire_time.unwrap_or(scheduled),
                previous_fire_time: previous,
                fire_time: now,
                recovering,
                job,
                trigger,
                record,
            }));
        }

        tx.commit()?;
        Ok(results)
    }

    /// Give back a trigger acquired but not fired: it returns to `WAITING`
    /// with its fire time unchanged and its ledger row is deleted.
    ///
    /// Needs no cluster lock; the whole release is one transaction touching
    /// only rows this instance owns.
    #[instrument(skip(self, acquired), fields(trigger = %acquired.trigger.key))]
    pub fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<()> {
        let sched = self.sched_name().to_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let key = &acquired.record.trigger_key;
        transition(&tx, &sched, key, TriggerState::Acquired, TriggerState::Waiting)?;
        ledger::remove(&tx, &sched, &acquired.record.entry_id)?;
        unblock_job_if_idle(&tx, &sched, &acquired.record.job_key)?;
        tx.commit()?;
        debug!("acquired trigger released");
        Ok(())
    }

    /// Record the end of a firing: delete its ledger row, apply `instruction`
    /// and unblock the job if no other firing of it remains.
    #[instrument(skip(self, guard, bundle), fields(trigger = %bundle.trigger.key, %instruction))]
    pub fn triggered_job_complete(
        &self,
        guard: &LockGuard,
        bundle: &TriggerFiredBundle,
        instruction: CompletionInstruction,
    ) -> Result<()> {
        let sched = self.sched_name().to_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        guard.verify(&tx, LockName::StateAccess)?;

        ledger::remove(&tx, &sched, &bundle.record.entry_id)?;
        let key = &bundle.trigger.key;
        let job_key = &bundle.job.key;

        match instruction {
            CompletionInstruction::Noop => {
                // the final firing of a schedule that was not deleted
                if load_trigger(&tx, &sched, key)?.is_some_and(|t| t.state == TriggerState::Executing) {
                    transition(&tx, &sched, key, TriggerState::Executing, TriggerState::Complete)?;
                }
            }
            CompletionInstruction::DeleteTrigger => {
                // a trigger rescheduled while the job ran keeps its new fire time
                if let Some(t) = load_trigger(&tx, &sched, key)?.filter(|t| t.next_fire_time.is_none()) {
                    remove_trigger_cascading(&tx, &sched, &t)?;
                    debug!("exhausted trigger deleted");
                }
            }
            CompletionInstruction::SetTriggerComplete => {
                move_to_if_legal(&tx, &sched, key, TriggerState::Complete)?;
            }
            CompletionInstruction::SetTriggerError => {
                move_to_if_legal(&tx, &sched, key, TriggerState::Error)?;
                warn!("trigger set to error");
            }
            CompletionInstruction::SetAllJobTriggersComplete => {
                for t in triggers_of_job(&tx, &sched, job_key)? {
                    move_to_if_legal(&tx, &sched, &t.key, TriggerState::Complete)?;
                }
            }
            CompletionInstruction::SetAllJobTriggersError => {
                for t in triggers_of_job(&tx, &sched, job_key)? {
                    move_to_if_legal(&tx, &sched, &t.key, TriggerState::Error)?;
                }
                warn!(job = %job_key, "all job triggers set to error");
            }
        }
        unblock_job_if_idle(&tx, &sched, job_key)?;
        tx.commit()?;
        Ok(())
    }

    /// Apply misfire policy to at most `max` overdue waiting triggers.
    #[instrument(skip(self, guard))]
    pub fn recover_misfired_triggers(
        &self,
        guard: &LockGuard,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<usize> {
        let sched = self.sched_name().to_string();
        let threshold = self.misfire_threshold();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        guard.verify(&tx, LockName::MisfireAccess)?;

        let overdue = {
            let sql = format!(
                "SELECT {TRIGGER_COLUMNS} FROM triggers
                 WHERE sched_name = ?1 AND state = ?2
                   AND next_fire_time IS NOT NULL AND next_fire_time < ?3
                   AND misfire_instruction <> 'ignore_misfires'
                 ORDER BY next_fire_time, priority DESC
                 LIMIT ?4"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![
                    sched,
                    TriggerState::Waiting.as_str(),
                    (now - threshold).timestamp_millis(),
                    max as i64
                ],
                row_to_trigger,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut handled = 0;
        for mut trigger in overdue {
            if !is_misfired(&trigger, now, threshold) {
                continue;
            }
            let next = apply_misfire(&mut trigger, now);
            update_fire_times(&tx, &sched, &trigger)?;
            if next.is_none() {
                transition(&tx, &sched, &trigger.key, TriggerState::Waiting, TriggerState::Complete)?;
            }
            debug!(trigger = %trigger.key, next_fire_time = ?next, "misfire handled");
            handled += 1;
        }
        tx.commit()?;
        if handled > 0 {
            info!(handled, "misfired triggers handled");
        }
        Ok(handled)
    }
}
