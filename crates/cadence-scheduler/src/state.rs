//! Trigger and ledger state vocabulary, and the legal trigger transitions.
//!
//! Every persisted trigger state change goes through
//! [`TriggerState::can_transition_to`]; the repository refuses anything else
//! with a `ConsistencyViolation`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Persisted lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Eligible for acquisition once its next fire time is due.
    Waiting,
    /// Claimed by an acquisition cycle; a ledger row exists.
    Acquired,
    /// Its final firing is in flight; no further fire time exists.
    Executing,
    /// Schedule exhausted or explicitly completed.
    Complete,
    /// Needs operator intervention (`reset_trigger_from_error`).
    Error,
    /// Held while a prior firing of its non-concurrent job is unfinished.
    Blocked,
    /// Suspended by an administrative call.
    Paused,
    /// Paused while also blocked; resumes into `Blocked`.
    PausedBlocked,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Error => "ERROR",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::Paused => "PAUSED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: TriggerState) -> bool {
        use TriggerState::*;
        matches!(
            (self, next),
            (Waiting, Waiting | Acquired | Blocked | Paused | Complete | Error)
                | (Acquired, Waiting | Executing | Blocked | Paused | Complete | Error)
                | (Executing, Complete | Error)
                | (Blocked, Waiting | PausedBlocked | Complete | Error)
                | (Paused, Waiting | Blocked | PausedBlocked | Complete | Error)
                | (PausedBlocked, Paused | Blocked | Complete | Error)
                | (Error, Waiting | Paused)
        )
    }

    /// `Complete` and `Error` are never left by the engine on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, TriggerState::Complete | TriggerState::Error)
    }

    /// The state a trigger takes when its job becomes concurrency-blocked.
    pub fn blocked(self) -> Self {
        match self {
            TriggerState::Waiting | TriggerState::Acquired => TriggerState::Blocked,
            TriggerState::Paused => TriggerState::PausedBlocked,
            other => other,
        }
    }

    /// The state a blocked trigger returns to once its job is idle again.
    pub fn unblocked(self) -> Self {
        match self {
            TriggerState::Blocked => TriggerState::Waiting,
            TriggerState::PausedBlocked => TriggerState::Paused,
            other => other,
        }
    }

    /// The state a trigger takes when paused.
    pub fn paused(self) -> Self {
        match self {
            TriggerState::Waiting | TriggerState::Acquired => TriggerState::Paused,
            TriggerState::Blocked => TriggerState::PausedBlocked,
            other => other,
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(TriggerState::Waiting),
            "ACQUIRED" => Ok(TriggerState::Acquired),
            "EXECUTING" => Ok(TriggerState::Executing),
            "COMPLETE" => Ok(TriggerState::Complete),
            "ERROR" => Ok(TriggerState::Error),
            "BLOCKED" => Ok(TriggerState::Blocked),
            "PAUSED" => Ok(TriggerState::Paused),
            "PAUSED_BLOCKED" => Ok(TriggerState::PausedBlocked),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// Externally reported trigger state, as returned by `get_trigger_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerStatus {
    Waiting,
    Acquired,
    Executing,
    Complete,
    Error,
    Blocked,
    Paused,
    /// No trigger with that key exists.
    None,
}

impl From<Option<TriggerState>> for TriggerStatus {
    fn from(state: Option<TriggerState>) -> Self {
        match state {
            None => TriggerStatus::None,
            Some(TriggerState::Waiting) => TriggerStatus::Waiting,
            Some(TriggerState::Acquired) => TriggerStatus::Acquired,
            Some(TriggerState::Executing) => TriggerStatus::Executing,
            Some(TriggerState::Complete) => TriggerStatus::Complete,
            Some(TriggerState::Error) => TriggerStatus::Error,
            Some(TriggerState::Blocked) => TriggerStatus::Blocked,
            Some(TriggerState::Paused | TriggerState::PausedBlocked) => TriggerStatus::Paused,
        }
    }
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerStatus::Waiting => "WAITING",
            TriggerStatus::Acquired => "ACQUIRED",
            TriggerStatus::Executing => "EXECUTING",
            TriggerStatus::Complete => "COMPLETE",
            TriggerStatus::Error => "ERROR",
            TriggerStatus::Blocked => "BLOCKED",
            TriggerStatus::Paused => "PAUSED",
            TriggerStatus::None => "NONE",
        };
        f.write_str(s)
    }
}

/// State of a fired-trigger ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FiredState {
    Acquired,
    Executing,
}

impl FiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiredState::Acquired => "ACQUIRED",
            FiredState::Executing => "EXECUTING",
        }
    }
}

impl fmt::Display for FiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FiredState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ACQUIRED" => Ok(FiredState::Acquired),
            "EXECUTING" => Ok(FiredState::Executing),
            other => Err(format!("unknown fired state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TriggerState; 8] = [
        TriggerState::Waiting,
        TriggerState::Acquired,
        TriggerState::Executing,
        TriggerState::Complete,
        TriggerState::Error,
        TriggerState::Blocked,
        TriggerState::Paused,
        TriggerState::PausedBlocked,
    ];

    #[test]
    fn complete_is_a_sink() {
        for next in ALL {
            assert!(!TriggerState::Complete.can_transition_to(next));
        }
    }

    #[test]
    fn error_only_leaves_towards_waiting_or_paused() {
        let allowed: Vec<_> = ALL
            .into_iter()
            .filter(|s| TriggerState::Error.can_transition_to(*s))
            .collect();
        assert_eq!(allowed, vec![TriggerState::Waiting, TriggerState::Paused]);
    }

    #[test]
    fn acquired_can_be_released_but_executing_cannot() {
        assert!(TriggerState::Acquired.can_transition_to(TriggerState::Waiting));
        assert!(!TriggerState::Executing.can_transition_to(TriggerState::Waiting));
    }

    #[test]
    fn blocked_and_paused_compose() {
        assert_eq!(TriggerState::Paused.blocked(), TriggerState::PausedBlocked);
        assert_eq!(TriggerState::Blocked.paused(), TriggerState::PausedBlocked);
        assert_eq!(TriggerState::PausedBlocked.unblocked(), TriggerState::Paused);
        assert_eq!(TriggerState::Blocked.unblocked(), TriggerState::Waiting);
        assert_eq!(TriggerState::Complete.blocked(), TriggerState::Complete);
    }

    #[test]
    fn every_helper_result_is_a_legal_transition() {
        for s in ALL {
            for next in [s.blocked(), s.unblocked(), s.paused()] {
                assert!(next == s || s.can_transition_to(next), "{s} -> {next}");
            }
        }
    }

    #[test]
    fn states_round_trip_through_str() {
        for s in ALL {
            assert_eq!(s.as_str().parse::<TriggerState>().unwrap(), s);
        }
        assert_eq!("EXECUTING".parse::<FiredState>().unwrap(), FiredState::Executing);
    }

    #[test]
    fn paused_blocked_is_reported_as_paused() {
        assert_eq!(
            TriggerStatus::from(Some(TriggerState::PausedBlocked)),
            TriggerStatus::Paused
        );
        assert_eq!(TriggerStatus::from(None), TriggerStatus::None);
    }
}
