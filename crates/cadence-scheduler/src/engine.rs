use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use cadence_core::CadenceConfig;
use chrono::Utc;
use rusqlite::Connection;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    db::{init_db, verify_schema},
    dispatcher::{backoff, Dispatcher, WorkerContext},
    error::{Result, SchedulerError},
    job::JobRegistry,
    listener::ListenerRegistry,
    lock::{ClusterLock, LockName},
    recovery::RecoveryReport,
    repository::JobStore,
    state::TriggerStatus,
    types::{AcquiredTrigger, FiredTriggerRecord, JobDefinition, JobKey, TriggerDefinition, TriggerKey},
};

/// Loop timing and limits, resolved once from [`CadenceConfig`].
#[derive(Debug, Clone)]
struct Settings {
    clustered: bool,
    batch_size: usize,
    lookahead: chrono::Duration,
    idle_wait: Duration,
    misfire_threshold: Duration,
    max_misfires_per_pass: usize,
    checkin_interval: Duration,
    failure_grace: Duration,
    lock_timeout: Duration,
    retry_backoff: Duration,
}

impl Settings {
    fn from_config(config: &CadenceConfig) -> Self {
        Self {
            clustered: config.cluster.clustered,
            batch_size: config.scheduler.batch_size.max(1),
            lookahead: chrono::Duration::milliseconds(
                config.scheduler.lookahead().as_millis() as i64,
            ),
            idle_wait: config.scheduler.idle_wait(),
            misfire_threshold: config.scheduler.misfire_threshold(),
            max_misfires_per_pass: config.scheduler.max_misfires_per_pass.max(1),
            checkin_interval: config.cluster.checkin_interval(),
            failure_grace: config.cluster.failure_grace(),
            lock_timeout: config.cluster.lock_timeout(),
            retry_backoff: config.scheduler.retry_backoff(),
        }
    }

    /// Period of the maintenance loop.
    fn maintenance_period(&self) -> Duration {
        let period = if self.clustered {
            self.checkin_interval.min(self.misfire_threshold)
        } else {
            self.misfire_threshold
        };
        period.max(Duration::from_millis(10))
    }
}

struct Shared {
    store: JobStore,
    locks: ClusterLock,
    jobs: Arc<JobRegistry>,
    listeners: Arc<ListenerRegistry>,
    dispatcher: Dispatcher,
    settings: Settings,
    shutdown_tx: watch::Sender<bool>,
    /// Signalled whenever the schedule changes or a worker finishes.
    wakeup: Arc<Notify>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

/// Persistent, clusterable job scheduler.
///
/// One engine is one scheduler instance: an acquisition loop, a maintenance
/// loop and a bounded pool of workers, all coordinating with other instances
/// only through the shared database.
pub struct SchedulerEngine {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerEngine {
    /// Create an engine on `conn`, creating or verifying the schema as configured.
    pub fn new(conn: Connection, config: &CadenceConfig, jobs: Arc<JobRegistry>) -> Result<Self> {
        if config.database.create_schema {
            init_db(&conn)?;
        } else {
            verify_schema(&conn)?;
        }
        let settings = Settings::from_config(config);
        let instance_id = config.scheduler.resolved_instance_id();
        let sched_name = config.scheduler.instance_name.clone();
        let conn = Arc::new(Mutex::new(conn));

        let store = JobStore::new(
            Arc::clone(&conn),
            sched_name.clone(),
            instance_id.clone(),
            settings.misfire_threshold,
        );
        let locks = ClusterLock::new(
            conn,
            sched_name.clone(),
            instance_id.clone(),
            config.cluster.lock_lease(),
            config.cluster.lock_retry(),
        );
        let listeners = Arc::new(ListenerRegistry::new());
        let wakeup = Arc::new(Notify::new());
        let dispatcher = Dispatcher::new(
            WorkerContext {
                store: store.clone(),
                locks: locks.clone(),
                jobs: Arc::clone(&jobs),
                listeners: Arc::clone(&listeners),
                wakeup: Arc::clone(&wakeup),
                max_refires: config.scheduler.max_refires,
                completion_retries: config.scheduler.completion_retries,
                retry_backoff: settings.retry_backoff,
                lock_timeout: settings.lock_timeout,
            },
            config.scheduler.max_concurrency,
        );
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            sched = %sched_name,
            instance_id = %instance_id,
            clustered = settings.clustered,
            max_concurrency = config.scheduler.max_concurrency,
            "scheduler engine created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                locks,
                jobs,
                listeners,
                dispatcher,
                settings,
                shutdown_tx,
                wakeup,
                started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Recover orphaned firings, then start the acquisition and maintenance loops.
    ///
    /// Calling `start` on a running engine is a no-op; a shut-down engine
    /// cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::Shutdown);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let report = match self.shared.recover_on_start().await {
            Ok(report) => report,
            Err(e) => {
                self.shared.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        if !report.is_empty() {
            info!(?report, "startup recovery finished");
        }
        if self.shared.settings.clustered {
            if let Err(e) = self.shared.checkin().await {
                warn!(error = %e, "initial check-in failed");
            }
        }

        let acquisition = tokio::spawn(acquisition_loop(
            Arc::clone(&self.shared),
            self.shared.shutdown_tx.subscribe(),
        ));
        let maintenance = tokio::spawn(maintenance_loop(
            Arc::clone(&self.shared),
            self.shared.shutdown_tx.subscribe(),
        ));
        self.tasks
            .lock()
            .map_err(|_| SchedulerError::Poisoned)?
            .extend([acquisition, maintenance]);

        info!(instance_id = %self.shared.store.instance_id(), "scheduler started");
        Ok(())
    }

    /// Stop the loops. Triggers acquired but not yet fired are released.
    ///
    /// With `wait_for_jobs_to_complete`, also waits for running jobs to finish
    /// and report, then removes this instance's check-in row.
    pub async fn shutdown(&self, wait_for_jobs_to_complete: bool) -> Result<()> {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(wait_for_jobs_to_complete, "scheduler shutting down");
        let _ = self.shared.shutdown_tx.send(true);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .map_err(|_| SchedulerError::Poisoned)?
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler loop ended abnormally");
            }
        }

        if wait_for_jobs_to_complete {
            self.shared.dispatcher.wait_idle().await;
            self.shared
                .store
                .remove_instance_state(self.shared.store.instance_id())?;
        }
        info!("scheduler shut down");
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> &str {
        self.shared.store.instance_id()
    }

    pub fn store(&self) -> &JobStore {
        &self.shared.store
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.shared.jobs
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.shared.listeners
    }

    fn schedule_changed(&self) {
        self.shared.wakeup.notify_one();
    }

    // ── administrative API ───────────────────────────────────────────────────

    /// Store a new job with its first trigger.
    pub fn schedule_job(
        &self,
        job: &JobDefinition,
        trigger: &TriggerDefinition,
    ) -> Result<TriggerDefinition> {
        let stored = self.shared.store.store_job_and_trigger(job, trigger)?;
        self.schedule_changed();
        Ok(stored)
    }

    /// Store a job without a trigger. Non-durable jobs need `replace` of an
    /// existing job that already has triggers.
    pub fn add_job(&self, job: &JobDefinition, replace: bool) -> Result<()> {
        self.shared.store.store_job(job, replace)
    }

    /// Add a trigger to an existing job.
    pub fn schedule_trigger(&self, trigger: &TriggerDefinition) -> Result<TriggerDefinition> {
        let stored = self.shared.store.store_trigger(trigger, false)?;
        self.schedule_changed();
        Ok(stored)
    }

    /// Replace the trigger `key` with `new_trigger`. `None` if `key` did not exist.
    pub fn reschedule_job(
        &self,
        key: &TriggerKey,
        new_trigger: &TriggerDefinition,
    ) -> Result<Option<TriggerDefinition>> {
        let stored = self.shared.store.replace_trigger(key, new_trigger)?;
        self.schedule_changed();
        Ok(stored)
    }

    /// Remove a trigger (and its job, if non-durable and now trigger-less).
    pub fn unschedule_job(&self, key: &TriggerKey) -> Result<bool> {
        let found = self.shared.store.remove_trigger(key)?;
        self.schedule_changed();
        Ok(found)
    }

    pub fn delete_job(&self, key: &JobKey) -> Result<bool> {
        let found = self.shared.store.remove_job(key)?;
        self.schedule_changed();
        Ok(found)
    }

    pub fn pause_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let found = self.shared.store.pause_trigger(key)?;
        self.schedule_changed();
        Ok(found)
    }

    pub fn resume_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let found = self.shared.store.resume_trigger(key, Utc::now())?;
        self.schedule_changed();
        Ok(found)
    }

    pub fn pause_job(&self, key: &JobKey) -> Result<bool> {
        let found = self.shared.store.pause_job(key)?;
        self.schedule_changed();
        Ok(found)
    }

    pub fn resume_job(&self, key: &JobKey) -> Result<bool> {
        let found = self.shared.store.resume_job(key, Utc::now())?;
        self.schedule_changed();
        Ok(found)
    }

    pub fn reset_trigger_from_error(&self, key: &TriggerKey) -> Result<bool> {
        let found = self.shared.store.reset_trigger_from_error(key)?;
        self.schedule_changed();
        Ok(found)
    }

    pub fn get_trigger_state(&self, key: &TriggerKey) -> Result<TriggerStatus> {
        Ok(self.shared.store.trigger_state(key)?.into())
    }

    pub fn get_trigger(&self, key: &TriggerKey) -> Result<Option<TriggerDefinition>> {
        self.shared.store.retrieve_trigger(key)
    }

    pub fn get_job(&self, key: &JobKey) -> Result<Option<JobDefinition>> {
        self.shared.store.retrieve_job(key)
    }

    pub fn get_triggers_of_job(&self, key: &JobKey) -> Result<Vec<TriggerDefinition>> {
        self.shared.store.triggers_of_job(key)
    }

    /// Firings of this instance currently executing, read from the ledger.
    pub fn get_currently_executing_jobs(&self) -> Result<Vec<FiredTriggerRecord>> {
        self.shared.store.currently_executing()
    }

    /// Delete all jobs, triggers and ledger rows of this scheduler name.
    pub fn clear(&self) -> Result<()> {
        self.shared.store.clear()
    }
}

impl Drop for SchedulerEngine {
    fn drop(&mut self) {
        // loops notice, release what they hold and exit
        let _ = self.shared.shutdown_tx.send(true);
    }
}

impl Shared {
    async fn recover_on_start(&self) -> Result<RecoveryReport> {
        let guard = self
            .locks
            .acquire(LockName::MisfireAccess, self.settings.lock_timeout)
            .await?;
        let now = Utc::now();
        let instances = if self.settings.clustered {
            let grace = chrono::Duration::milliseconds(self.settings.failure_grace.as_millis() as i64);
            self.store.failed_instances(now, grace, true)?
        } else {
            self.store.instances_with_fired_triggers()?
        };
        let report = self.store.recover_instances(&guard, &instances, now)?;
        self.store
            .recover_misfired_triggers(&guard, now, self.settings.max_misfires_per_pass)?;
        Ok(report)
    }

    async fn checkin(&self) -> Result<()> {
        let guard = self
            .locks
            .acquire(LockName::StateAccess, self.settings.lock_timeout)
            .await?;
        let interval = chrono::Duration::milliseconds(self.settings.checkin_interval.as_millis() as i64);
        self.store.checkin(&guard, Utc::now(), interval)
    }

    async fn acquire(&self, max_count: usize) -> Result<Vec<AcquiredTrigger>> {
        let guard = self
            .locks
            .acquire(LockName::TriggerAccess, self.settings.lock_timeout)
            .await?;
        self.store
            .acquire_next_triggers(&guard, Utc::now(), max_count, self.settings.lookahead)
    }

    async fn fire(&self, acquired: &[AcquiredTrigger]) -> Result<Vec<Option<crate::types::TriggerFiredBundle>>> {
        let guard = self
            .locks
            .acquire(LockName::TriggerAccess, self.settings.lock_timeout)
            .await?;
        self.store.triggers_fired(&guard, acquired, Utc::now())
    }

    fn release_all(&self, acquired: &[AcquiredTrigger]) {
        for a in acquired {
            if let Err(e) = self.store.release_acquired_trigger(a) {
                error!(trigger = %a.trigger.key, error = %e, "failed to release acquired trigger");
            }
        }
        if !acquired.is_empty() {
            info!(count = acquired.len(), "released acquired triggers");
        }
    }

    /// Check in, recover failed peers and correct misfires.
    async fn maintenance_pass(&self) -> Result<()> {
        let now = Utc::now();
        if self.settings.clustered {
            self.checkin().await?;
            let grace = chrono::Duration::milliseconds(self.settings.failure_grace.as_millis() as i64);
            let failed = self.store.failed_instances(now, grace, false)?;
            if !failed.is_empty() {
                warn!(instances = ?failed, "detected failed scheduler instances");
                let guard = self
                    .locks
                    .acquire(LockName::MisfireAccess, self.settings.lock_timeout)
                    .await?;
                let report = self.store.recover_instances(&guard, &failed, now)?;
                drop(guard);
                if !report.is_empty() {
                    self.wakeup.notify_one();
                }
            }
        }

        let guard = self
            .locks
            .acquire(LockName::MisfireAccess, self.settings.lock_timeout)
            .await?;
        let handled = self
            .store
            .recover_misfired_triggers(&guard, now, self.settings.max_misfires_per_pass)?;
        drop(guard);
        if handled > 0 {
            self.wakeup.notify_one();
        }
        Ok(())
    }
}

/// Acquire due triggers while worker capacity allows, wait for their fire
/// time, fire them and hand them to workers.
async fn acquisition_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    debug!("acquisition loop started");
    let settings = shared.settings.clone();
    let mut failures = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permits = tokio::select! {
            permits = shared.dispatcher.reserve(settings.batch_size) => permits,
            _ = shutdown.changed() => break,
        };
        if permits.is_empty() {
            break;
        }

        let acquired = match shared.acquire(permits.len()).await {
            Ok(acquired) => {
                failures = 0;
                acquired
            }
            Err(e) => {
                drop(permits);
                failures += 1;
                let wait = backoff(settings.retry_backoff, failures).min(settings.idle_wait * 10);
                if matches!(e, SchedulerError::LockTimeout { .. }) {
                    debug!(error = %e, "trigger lock busy, skipping cycle");
                } else {
                    warn!(error = %e, code = e.code(), failures, "trigger acquisition failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(wait) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        if acquired.is_empty() {
            drop(permits);
            tokio::select! {
                _ = tokio::time::sleep(settings.idle_wait) => {}
                _ = shared.wakeup.notified() => {}
                _ = shutdown.changed() => break,
            }
            continue;
        }

        let earliest = acquired
            .iter()
            .filter_map(|a| a.trigger.next_fire_time)
            .min()
            .unwrap_or_else(Utc::now);
        let delay = (earliest - Utc::now()).to_std().unwrap_or_default();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, count = acquired.len(), "waiting for fire time");
            let stop = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = shutdown.changed() => true,
            };
            if stop {
                shared.release_all(&acquired);
                break;
            }
        }
        if *shutdown.borrow() {
            shared.release_all(&acquired);
            break;
        }

        match shared.fire(&acquired).await {
            Ok(results) => {
                let mut permits = permits.into_iter();
                for bundle in results.into_iter().flatten() {
                    let Some(permit) = permits.next() else {
                        error!("more fired triggers than reserved worker slots");
                        break;
                    };
                    debug!(trigger = %bundle.trigger.key, job = %bundle.job.key, "trigger fired");
                    shared.dispatcher.spawn(permit, bundle);
                }
                debug!(busy = shared.dispatcher.busy(), "workers busy");
            }
            Err(e) => {
                warn!(error = %e, code = e.code(), "firing acquired triggers failed; releasing them");
                shared.release_all(&acquired);
            }
        }
    }
    debug!("acquisition loop stopped");
}

async fn maintenance_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let period = shared.settings.maintenance_period();
    debug!(period_ms = period.as_millis() as u64, "maintenance loop started");
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately; startup already ran a pass
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = shared.maintenance_pass().await {
                    if e.is_retryable() {
                        debug!(error = %e, "maintenance pass skipped");
                    } else {
                        error!(error = %e, code = e.code(), "maintenance pass failed");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("maintenance loop stopped");
}
