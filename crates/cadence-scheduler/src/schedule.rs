use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};

use crate::{
    error::{Result, SchedulerError},
    types::{MisfireInstruction, Schedule, TriggerDefinition},
};

/// Reject schedules that can never be evaluated.
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Once { .. } => Ok(()),
        Schedule::Interval { every_ms, .. } => {
            if *every_ms == 0 {
                Err(SchedulerError::InvalidSchedule(
                    "interval must be at least 1ms".into(),
                ))
            } else {
                Ok(())
            }
        }
        Schedule::Daily { hour, minute } => check_time(*hour, *minute),
        Schedule::Weekly { day, hour, minute } => {
            if *day > 6 {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "weekday must be 0-6, got {day}"
                )));
            }
            check_time(*hour, *minute)
        }
        Schedule::Cron { expression } => cron_schedule(expression).map(|_| ()),
    }
}

/// Parse a five-field `minute hour day-of-month month day-of-week` expression.
///
/// The `cron` crate wants a leading seconds field, pinned here to 0. Names
/// (`MON`, `JAN`) are accepted; numeric weekdays run 1-7 from Sunday.
fn cron_schedule(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "cron expression needs 5 fields, got {fields}: {expression:?}"
        )));
    }
    format!("0 {expression}").parse().map_err(|e: cron::error::Error| {
        SchedulerError::InvalidSchedule(format!("invalid cron expression {expression:?}: {e}"))
    })
}

fn check_time(hour: u8, minute: u8) -> Result<()> {
    if hour > 23 || minute > 59 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "invalid time of day {hour:02}:{minute:02}"
        )));
    }
    Ok(())
}

/// The first fire time of a freshly stored trigger, or `None` if it will never fire.
pub fn first_fire_time(trigger: &TriggerDefinition) -> Option<DateTime<Utc>> {
    let first = match &trigger.schedule {
        Schedule::Once { at } => Some(*at),
        Schedule::Interval { .. } => Some(trigger.start_time),
        // calendar schedules: the first occurrence at or after the start time
        _ => calendar_after(
            &trigger.schedule,
            trigger.start_time - Duration::milliseconds(1),
        ),
    };
    first.filter(|t| within_end(trigger, *t))
}

/// Compute the next fire time strictly after `after`.
///
/// Returns `None` when the schedule is exhausted: a `Once` trigger that has
/// fired, an interval whose repeat count is used up, or anything past the
/// trigger's end time.
pub fn fire_time_after(trigger: &TriggerDefinition, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = match &trigger.schedule {
        Schedule::Once { at } => {
            if trigger.times_triggered == 0 && *at > after {
                Some(*at)
            } else {
                None
            }
        }

        Schedule::Interval {
            every_ms,
            repeat_count,
        } => {
            if repeat_count.is_some_and(|n| trigger.times_triggered > n) {
                return None;
            }
            let every = *every_ms as i64;
            let start = trigger.start_time;
            if after < start {
                Some(start)
            } else {
                let elapsed = (after - start).num_milliseconds();
                let k = elapsed / every + 1;
                Some(start + Duration::milliseconds(k * every))
            }
        }

        _ => calendar_after(&trigger.schedule, after),
    };
    next.filter(|t| within_end(trigger, *t))
}

fn within_end(trigger: &TriggerDefinition, t: DateTime<Utc>) -> bool {
    trigger.end_time.map_or(true, |end| t <= end)
}

fn calendar_after(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Daily { hour, minute } => next_time_of_day(from, *hour, *minute, None),
        Schedule::Weekly { day, hour, minute } => {
            next_time_of_day(from, *hour, *minute, Some(*day))
        }
        Schedule::Cron { expression } => cron_schedule(expression).ok()?.after(&from).next(),
        Schedule::Once { .. } | Schedule::Interval { .. } => None,
    }
}

/// First `hour:minute` UTC strictly after `from`, on `weekday` (0 = Monday)
/// when one is given. A week plus a day of candidates always contains it.
fn next_time_of_day(
    from: DateTime<Utc>,
    hour: u8,
    minute: u8,
    weekday: Option<u8>,
) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour as u32, minute as u32, 0)?;
    from.date_naive()
        .iter_days()
        .take(8)
        .map(|date| Utc.from_utc_datetime(&date.and_time(time)))
        .filter(|candidate| {
            weekday.map_or(true, |d| candidate.weekday().num_days_from_monday() == d as u32)
        })
        .find(|candidate| *candidate > from)
}

/// Record a firing: the scheduled time becomes the previous fire time and the
/// next one is computed from it, as if the trigger had fired on schedule.
pub fn advance_after_fire(trigger: &mut TriggerDefinition) {
    let scheduled = trigger.next_fire_time;
    trigger.times_triggered += 1;
    trigger.previous_fire_time = scheduled;
    trigger.next_fire_time = scheduled.and_then(|t| fire_time_after(trigger, t));
}

/// True when the trigger's fire time is older than `now - threshold` and its
/// policy does not ignore misfires.
pub fn is_misfired(trigger: &TriggerDefinition, now: DateTime<Utc>, threshold: Duration) -> bool {
    if trigger.misfire_instruction == MisfireInstruction::IgnoreMisfires {
        return false;
    }
    trigger
        .next_fire_time
        .is_some_and(|next| next < now - threshold)
}

/// The concrete policy `Smart` stands for on this trigger's schedule.
pub fn effective_misfire_instruction(trigger: &TriggerDefinition) -> MisfireInstruction {
    match (trigger.misfire_instruction, &trigger.schedule) {
        (MisfireInstruction::Smart, Schedule::Once { .. }) => MisfireInstruction::FireNow,
        (
            MisfireInstruction::Smart,
            Schedule::Interval {
                repeat_count: Some(_),
                ..
            },
        ) => MisfireInstruction::RescheduleNow,
        (
            MisfireInstruction::Smart,
            Schedule::Interval {
                repeat_count: None,
                ..
            },
        ) => MisfireInstruction::DoNothing,
        (MisfireInstruction::Smart, _) => MisfireInstruction::FireNow,
        // rescheduling only has meaning for interval schedules
        (MisfireInstruction::RescheduleNow, s) if !matches!(s, Schedule::Interval { .. }) => {
            MisfireInstruction::FireNow
        }
        (other, _) => other,
    }
}

/// Apply the trigger's misfire policy at `now`, updating its fire times in place.
///
/// Returns the new next fire time; `None` means the trigger is exhausted and
/// must move to `COMPLETE`.
pub fn apply_misfire(trigger: &mut TriggerDefinition, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = match effective_misfire_instruction(trigger) {
        MisfireInstruction::FireNow => Some(now),
        MisfireInstruction::DoNothing => fire_time_after(trigger, now),
        MisfireInstruction::RescheduleNow => {
            trigger.start_time = now;
            Some(now).filter(|t| within_end(trigger, *t))
        }
        MisfireInstruction::IgnoreMisfires | MisfireInstruction::Smart => trigger.next_fire_time,
    };
    trigger.next_fire_time = next;
    next
}
