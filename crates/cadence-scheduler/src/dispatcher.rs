//! Bounded worker pool that runs fired jobs and reports their completion.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    job::{instruction_for, ExecutionOutcome, Job, JobExecutionContext, JobRegistry},
    listener::{ListenerDecision, ListenerRegistry},
    lock::{ClusterLock, LockName},
    repository::JobStore,
    types::{CompletionInstruction, TriggerFiredBundle},
};

/// Everything a worker needs, shared by all workers of one engine.
pub(crate) struct WorkerContext {
    pub store: JobStore,
    pub locks: ClusterLock,
    pub jobs: Arc<JobRegistry>,
    pub listeners: Arc<ListenerRegistry>,
    /// Woken after each completion so blocked triggers are picked up promptly.
    pub wakeup: Arc<Notify>,
    pub max_refires: u32,
    pub completion_retries: u32,
    pub retry_backoff: Duration,
    pub lock_timeout: Duration,
}

pub(crate) struct Dispatcher {
    permits: Arc<Semaphore>,
    capacity: usize,
    ctx: Arc<WorkerContext>,
}

impl Dispatcher {
    pub fn new(ctx: WorkerContext, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            ctx: Arc::new(ctx),
        }
    }

    /// Wait until at least one worker slot is free, then take up to `max`
    /// slots without waiting further.
    pub async fn reserve(&self, max: usize) -> Vec<OwnedSemaphorePermit> {
        let Ok(first) = Arc::clone(&self.permits).acquire_owned().await else {
            return Vec::new();
        };
        let mut permits = vec![first];
        while permits.len() < max {
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(p) => permits.push(p),
                Err(_) => break,
            }
        }
        permits
    }

    pub fn busy(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Run one firing on its own task. The permit is held until completion
    /// has been reported.
    pub fn spawn(&self, permit: OwnedSemaphorePermit, bundle: TriggerFiredBundle) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let span = tracing::info_span!(
            "job",
            job = %bundle.job.key,
            trigger = %bundle.trigger.key,
            fire_id = %bundle.record.entry_id
        );
        tokio::spawn(
            async move {
                let _permit = permit;
                let instruction = run_firing(&ctx, &bundle).await;
                report_completion(&ctx, &bundle, instruction).await;
                ctx.wakeup.notify_one();
            }
            .instrument(span),
        )
    }

    /// Wait until every worker has finished and reported.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.capacity as u32).await {
            drop(all);
        }
    }
}

async fn run_firing(ctx: &WorkerContext, bundle: &TriggerFiredBundle) -> CompletionInstruction {
    let mut exec_ctx = JobExecutionContext::from_bundle(bundle);

    if let ListenerDecision::Veto { .. } = ctx.listeners.job_to_be_executed(&exec_ctx) {
        ctx.listeners.job_execution_vetoed(&exec_ctx);
        // skipped, not failed
        return instruction_for(&ExecutionOutcome::Succeeded, &bundle.trigger);
    }

    let outcome = match ctx.jobs.get(&bundle.job.job_type) {
        None => {
            error!(job_type = %bundle.job.job_type, "no job registered for job type");
            ExecutionOutcome::Unregistered(bundle.job.job_type.clone())
        }
        Some(job) => loop {
            let outcome = execute_contained(Arc::clone(&job), exec_ctx.clone()).await;
            match &outcome {
                ExecutionOutcome::Faulted(fault)
                    if fault.refire_immediately && exec_ctx.refire_count < ctx.max_refires =>
                {
                    exec_ctx.refire_count += 1;
                    info!(refire_count = exec_ctx.refire_count, fault = %fault, "refiring job immediately");
                }
                _ => break outcome,
            }
        },
    };

    match &outcome {
        ExecutionOutcome::Succeeded => debug!(recovering = exec_ctx.recovering, "job succeeded"),
        ExecutionOutcome::Faulted(fault) => warn!(fault = %fault, "job reported a fault"),
        ExecutionOutcome::Panicked(msg) => error!(panic = %msg, "job panicked"),
        ExecutionOutcome::Unregistered(_) => {}
    }
    ctx.listeners.job_was_executed(&exec_ctx, &outcome);
    instruction_for(&outcome, &bundle.trigger)
}

/// Run the job on a separate task so a panic surfaces as a `JoinError`
/// instead of taking the worker down.
async fn execute_contained(job: Arc<dyn Job>, ctx: JobExecutionContext) -> ExecutionOutcome {
    let handle = tokio::spawn(async move { job.execute(&ctx).await });
    match handle.await {
        Ok(Ok(())) => ExecutionOutcome::Succeeded,
        Ok(Err(fault)) => ExecutionOutcome::Faulted(fault),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            ExecutionOutcome::Panicked(msg)
        }
        Err(e) => ExecutionOutcome::Panicked(format!("job task cancelled: {e}")),
    }
}

/// Persist the completion under `STATE_ACCESS`, retrying with backoff.
///
/// When every attempt fails the ledger row is left in place; recovery
/// resolves it after this instance is gone.
async fn report_completion(
    ctx: &WorkerContext,
    bundle: &TriggerFiredBundle,
    instruction: CompletionInstruction,
) {
    let attempts = ctx.completion_retries.max(1);
    for attempt in 1..=attempts {
        let result = match ctx.locks.acquire(LockName::StateAccess, ctx.lock_timeout).await {
            Ok(guard) => ctx.store.triggered_job_complete(&guard, bundle, instruction),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!(%instruction, "completion reported");
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, code = e.code(), "failed to report job completion");
                if attempt < attempts {
                    tokio::time::sleep(backoff(ctx.retry_backoff, attempt)).await;
                }
            }
        }
    }
    error!(%instruction, "giving up on completion report; the firing is left for recovery");
}

/// Capped exponential backoff: `base * 2^(attempt-1)`, at most 32x `base`.
pub(crate) fn backoff(base: Duration, attempt: u32) -> Duration {
    base * 2u32.pow(attempt.saturating_sub(1).min(5))
}
