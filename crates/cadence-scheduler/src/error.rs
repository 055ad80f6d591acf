use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error. Treated as transient: the loops
    /// retry the whole cycle, and every multi-row effect is transactional.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is invalid or will never fire.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The job definition cannot be stored as given.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No row with the given key exists in the store.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// A row with the given key already exists and replacement was not requested.
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    /// The named cluster lock could not be taken before the timeout elapsed.
    #[error("Timed out after {waited_ms}ms waiting for cluster lock {lock}")]
    LockTimeout { lock: &'static str, waited_ms: u64 },

    /// The lease on a held lock expired (and may have been taken by a peer).
    #[error("Cluster lock {lock} is no longer held by this instance")]
    LockLost { lock: &'static str },

    /// Stored rows contradict each other or an illegal state transition was requested.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required table is absent and schema creation is disabled.
    #[error("Schema missing: table {0} does not exist")]
    SchemaMissing(String),

    #[error("Scheduler has been shut down")]
    Shutdown,

    /// A thread panicked while holding the store connection.
    #[error("Store connection mutex poisoned")]
    Poisoned,
}

impl SchedulerError {
    /// Short error code string for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "TRANSIENT_STORE_ERROR",
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::InvalidJob(_) => "INVALID_JOB",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::AlreadyExists { .. } => "ALREADY_EXISTS",
            SchedulerError::LockTimeout { .. } => "LOCK_TIMEOUT",
            SchedulerError::LockLost { .. } => "LOCK_LOST",
            SchedulerError::ConsistencyViolation(_) => "CONSISTENCY_VIOLATION",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::SchemaMissing(_) => "SCHEMA_MISSING",
            SchedulerError::Shutdown => "SHUTDOWN",
            SchedulerError::Poisoned => "POISONED",
        }
    }

    /// True for failures a loop should simply retry on its next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_)
                | SchedulerError::LockTimeout { .. }
                | SchedulerError::LockLost { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
