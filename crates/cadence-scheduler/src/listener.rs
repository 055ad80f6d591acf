use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::job::{ExecutionOutcome, JobExecutionContext};

/// A listener's answer to "may this job run now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerDecision {
    Proceed,
    Veto { reason: String },
}

impl ListenerDecision {
    pub fn veto(reason: impl Into<String>) -> Self {
        ListenerDecision::Veto {
            reason: reason.into(),
        }
    }
}

/// Observer of job executions. Every method has a no-op default.
///
/// Callbacks run on the worker task and should return quickly.
pub trait JobListener: Send + Sync {
    /// Unique name, used for unregistering.
    fn name(&self) -> &str;

    fn job_to_be_executed(&self, _ctx: &JobExecutionContext) -> ListenerDecision {
        ListenerDecision::Proceed
    }

    fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) {}

    fn job_was_executed(&self, _ctx: &JobExecutionContext, _outcome: &ExecutionOutcome) {}
}

/// Registered listeners, consulted in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn JobListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, replacing one with the same name.
    pub fn register(&self, listener: Arc<dyn JobListener>) {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        listeners.retain(|l| l.name() != listener.name());
        debug!(name = %listener.name(), "job listener registered");
        listeners.push(listener);
    }

    /// Remove a listener by name. Silent no-op if the name is not found.
    pub fn unregister(&self, name: &str) -> bool {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        let removed = listeners.len() < before;
        if removed {
            debug!(name, "job listener unregistered");
        }
        removed
    }

    fn snapshot(&self) -> Vec<Arc<dyn JobListener>> {
        self.listeners.read().expect("listener registry poisoned").clone()
    }

    /// Ask every listener whether the job may run. Stops at the first veto.
    pub fn job_to_be_executed(&self, ctx: &JobExecutionContext) -> ListenerDecision {
        for listener in self.snapshot() {
            if let ListenerDecision::Veto { reason } = listener.job_to_be_executed(ctx) {
                warn!(
                    listener = %listener.name(),
                    job = %ctx.job_key,
                    trigger = %ctx.trigger_key,
                    reason,
                    "job execution vetoed"
                );
                return ListenerDecision::Veto { reason };
            }
        }
        ListenerDecision::Proceed
    }

    pub fn job_execution_vetoed(&self, ctx: &JobExecutionContext) {
        for listener in self.snapshot() {
            listener.job_execution_vetoed(ctx);
        }
    }

    pub fn job_was_executed(&self, ctx: &JobExecutionContext, outcome: &ExecutionOutcome) {
        for listener in self.snapshot() {
            listener.job_was_executed(ctx, outcome);
        }
    }
}
