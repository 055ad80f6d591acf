use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use cadence_core::CadenceConfig;
use cadence_scheduler::{
    db::{init_db, open_connection},
    ClusterLock, ExecutionOutcome, FiredState, Job, JobDefinition, JobExecutionContext,
    JobExecutionFault, JobKey, JobListener, JobRegistry, JobStore, ListenerDecision, LockName,
    Schedule, SchedulerEngine, TriggerDefinition, TriggerKey, TriggerStatus,
};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

// ── fixtures ─────────────────────────────────────────────────────────────────

fn config(instance: &str) -> CadenceConfig {
    let mut config = CadenceConfig::default();
    config.scheduler.instance_id = instance.to_string();
    config.scheduler.idle_wait_ms = 50;
    config.scheduler.lookahead_ms = 200;
    config.scheduler.retry_backoff_ms = 20;
    config.cluster.lock_timeout_ms = 2_000;
    config
}

fn engine(path: &Path, instance: &str, jobs: Arc<JobRegistry>) -> SchedulerEngine {
    let conn = open_connection(path, Duration::from_secs(5)).unwrap();
    SchedulerEngine::new(conn, &config(instance), jobs).unwrap()
}

/// Millisecond-precision now, so it survives a round trip through the store.
fn now_ms() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(Utc::now().timestamp_millis()).unwrap()
}

fn once(name: &str, job: &str, at: DateTime<Utc>) -> TriggerDefinition {
    TriggerDefinition::new(
        TriggerKey::named(name),
        JobKey::named(job),
        Schedule::Once { at },
        at,
    )
}

fn every_minute(name: &str, job: &str) -> TriggerDefinition {
    TriggerDefinition::new(
        TriggerKey::named(name),
        JobKey::named(job),
        Schedule::Interval {
            every_ms: 60_000,
            repeat_count: None,
        },
        now_ms(),
    )
}

async fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

#[derive(Default)]
struct Recorder {
    runs: Mutex<Vec<JobExecutionContext>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl Job for Recorder {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobExecutionFault> {
        self.runs.lock().unwrap().push(ctx.clone());
        Ok(())
    }
}

fn registry_with(job_type: &str, job: Arc<dyn Job>) -> Arc<JobRegistry> {
    let jobs = Arc::new(JobRegistry::new());
    jobs.register(job_type, job);
    jobs
}

#[derive(Default)]
struct Observer {
    veto: bool,
    vetoed: AtomicUsize,
    executed: Mutex<Vec<ExecutionOutcome>>,
}

impl JobListener for Observer {
    fn name(&self) -> &str {
        "observer"
    }

    fn job_to_be_executed(&self, _ctx: &JobExecutionContext) -> ListenerDecision {
        if self.veto {
            ListenerDecision::veto("closed")
        } else {
            ListenerDecision::Proceed
        }
    }

    fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) {
        self.vetoed.fetch_add(1, Ordering::SeqCst);
    }

    fn job_was_executed(&self, _ctx: &JobExecutionContext, outcome: &ExecutionOutcome) {
        self.executed.lock().unwrap().push(outcome.clone());
    }
}

/// Acquire and fire every due trigger as `instance`, then "crash" without
/// reporting completion.
fn fire_and_crash(path: &Path, instance: &str) -> usize {
    let conn = open_connection(path, Duration::from_secs(5)).unwrap();
    init_db(&conn).unwrap();
    let conn = Arc::new(Mutex::new(conn));
    let store = JobStore::new(
        Arc::clone(&conn),
        "CadenceScheduler",
        instance,
        Duration::from_secs(60),
    );
    let locks = ClusterLock::new(
        conn,
        "CadenceScheduler",
        instance,
        Duration::from_secs(30),
        Duration::from_millis(10),
    );

    let guard = locks.try_acquire(LockName::TriggerAccess).unwrap().unwrap();
    let acquired = store
        .acquire_next_triggers(&guard, Utc::now(), 10, chrono::Duration::seconds(1))
        .unwrap();
    let fired = store.triggers_fired(&guard, &acquired, Utc::now()).unwrap();
    fired.into_iter().flatten().count()
}

// ── firing ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn once_trigger_fires_and_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let recorder = Arc::new(Recorder::default());
    let engine = engine(&path, "node-1", registry_with("record", recorder.clone()));
    let observer = Arc::new(Observer::default());
    engine.listeners().register(observer.clone());

    let at = now_ms();
    engine
        .schedule_job(&JobDefinition::new(JobKey::named("report"), "record"), &once("t", "report", at))
        .unwrap();
    engine.start().await.unwrap();

    assert!(wait_for(Duration::from_secs(5), || recorder.count() == 1).await);
    assert!(
        wait_for(Duration::from_secs(5), || {
            engine.get_trigger_state(&TriggerKey::named("t")).unwrap() == TriggerStatus::None
        })
        .await
    );
    // non-durable job goes with its last trigger
    assert!(engine.get_job(&JobKey::named("report")).unwrap().is_none());

    let run = recorder.runs.lock().unwrap()[0].clone();
    assert!(!run.recovering);
    assert_eq!(run.scheduled_fire_time, at);
    assert_eq!(run.refire_count, 0);
    assert_eq!(
        observer.executed.lock().unwrap().as_slice(),
        &[ExecutionOutcome::Succeeded]
    );

    engine.shutdown(true).await.unwrap();
    assert!(engine.store().fired_records().unwrap().is_empty());
}

#[tokio::test]
async fn vetoed_firing_skips_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let recorder = Arc::new(Recorder::default());
    let engine = engine(&path, "node-1", registry_with("record", recorder.clone()));
    let observer = Arc::new(Observer {
        veto: true,
        ..Default::default()
    });
    engine.listeners().register(observer.clone());

    engine
        .schedule_job(&JobDefinition::new(JobKey::named("j"), "record"), &once("t", "j", now_ms()))
        .unwrap();
    engine.start().await.unwrap();

    assert!(wait_for(Duration::from_secs(5), || observer.vetoed.load(Ordering::SeqCst) == 1).await);
    assert!(
        wait_for(Duration::from_secs(5), || {
            engine.get_trigger_state(&TriggerKey::named("t")).unwrap() == TriggerStatus::None
        })
        .await
    );
    assert_eq!(recorder.count(), 0);
    assert!(observer.executed.lock().unwrap().is_empty());
    engine.shutdown(true).await.unwrap();
}

struct Panicking;

#[async_trait]
impl Job for Panicking {
    async fn execute(&self, _ctx: &JobExecutionContext) -> Result<(), JobExecutionFault> {
        panic!("disk on fire");
    }
}

#[tokio::test]
async fn panicking_job_puts_trigger_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let engine = engine(&path, "node-1", registry_with("panic", Arc::new(Panicking)));
    let observer = Arc::new(Observer::default());
    engine.listeners().register(observer.clone());

    engine
        .schedule_job(&JobDefinition::new(JobKey::named("j"), "panic"), &every_minute("t", "j"))
        .unwrap();
    engine.start().await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || {
            engine.get_trigger_state(&TriggerKey::named("t")).unwrap() == TriggerStatus::Error
        })
        .await
    );
    assert_eq!(
        observer.executed.lock().unwrap().as_slice(),
        &[ExecutionOutcome::Panicked("disk on fire".into())]
    );

    // an errored trigger can be put back into rotation
    assert!(engine.reset_trigger_from_error(&TriggerKey::named("t")).unwrap());
    assert_ne!(
        engine.get_trigger_state(&TriggerKey::named("t")).unwrap(),
        TriggerStatus::Error
    );
    engine.shutdown(true).await.unwrap();
}

struct Flaky {
    attempts: AtomicU32,
    seen: Mutex<Vec<u32>>,
}

#[async_trait]
impl Job for Flaky {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobExecutionFault> {
        self.seen.lock().unwrap().push(ctx.refire_count);
        if self.attempts.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(JobExecutionFault::new("transient").refire());
        }
        Ok(())
    }
}

#[tokio::test]
async fn refire_reruns_within_the_same_firing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let flaky = Arc::new(Flaky {
        attempts: AtomicU32::new(0),
        seen: Mutex::new(Vec::new()),
    });
    let engine = engine(&path, "node-1", registry_with("flaky", flaky.clone()));

    engine
        .schedule_job(&JobDefinition::new(JobKey::named("j"), "flaky"), &once("t", "j", now_ms()))
        .unwrap();
    engine.start().await.unwrap();

    assert!(wait_for(Duration::from_secs(5), || flaky.seen.lock().unwrap().len() == 3).await);
    engine.shutdown(true).await.unwrap();
    assert_eq!(flaky.seen.lock().unwrap().as_slice(), &[0, 1, 2]);
}

#[tokio::test]
async fn unregistered_job_type_errors_every_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let engine = engine(&path, "node-1", Arc::new(JobRegistry::new()));

    let mut later = every_minute("later", "ghost");
    later.start_time = now_ms() + chrono::Duration::hours(1);
    engine
        .schedule_job(&JobDefinition::new(JobKey::named("ghost"), "nobody"), &every_minute("now", "ghost"))
        .unwrap();
    engine.schedule_trigger(&later).unwrap();
    engine.start().await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || {
            ["now", "later"].iter().all(|name| {
                engine.get_trigger_state(&TriggerKey::named(*name)).unwrap() == TriggerStatus::Error
            })
        })
        .await
    );
    engine.shutdown(true).await.unwrap();
}

struct Gate {
    open: Notify,
    entered: AtomicUsize,
}

#[async_trait]
impl Job for Gate {
    async fn execute(&self, _ctx: &JobExecutionContext) -> Result<(), JobExecutionFault> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.open.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn currently_executing_jobs_come_from_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let gate = Arc::new(Gate {
        open: Notify::new(),
        entered: AtomicUsize::new(0),
    });
    let engine = engine(&path, "node-1", registry_with("gate", gate.clone()));

    engine
        .schedule_job(&JobDefinition::new(JobKey::named("j"), "gate"), &every_minute("t", "j"))
        .unwrap();
    engine.start().await.unwrap();

    assert!(wait_for(Duration::from_secs(5), || gate.entered.load(Ordering::SeqCst) == 1).await);
    let executing = engine.get_currently_executing_jobs().unwrap();
    assert_eq!(executing.len(), 1);
    assert_eq!(executing[0].job_key, JobKey::named("j"));
    assert_eq!(executing[0].instance_id, "node-1");

    gate.open.notify_one();
    assert!(
        wait_for(Duration::from_secs(5), || {
            engine.get_currently_executing_jobs().unwrap().is_empty()
        })
        .await
    );
    assert_eq!(
        engine.get_trigger_state(&TriggerKey::named("t")).unwrap(),
        TriggerStatus::Waiting
    );
    engine.shutdown(true).await.unwrap();
}

// ── recovery and shutdown ────────────────────────────────────────────────────

/// Hangs on its first run while `hang` is set, like a job cut off by a crash.
#[derive(Default)]
struct Stubborn {
    hang: AtomicBool,
    runs: AtomicUsize,
}

#[async_trait]
impl Job for Stubborn {
    async fn execute(&self, _ctx: &JobExecutionContext) -> Result<(), JobExecutionFault> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn blocked_repeating_job_runs_again_after_failover() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let stubborn = Arc::new(Stubborn::default());
    stubborn.hang.store(true, Ordering::SeqCst);
    let jobs = registry_with("stubborn", stubborn.clone());

    let mut cfg = config("single-node");
    cfg.scheduler.misfire_threshold_ms = 1_000;
    let open = |cfg: &CadenceConfig| {
        let conn = open_connection(&path, Duration::from_secs(5)).unwrap();
        SchedulerEngine::new(conn, cfg, Arc::clone(&jobs)).unwrap()
    };

    let first = open(&cfg);
    let mut job = JobDefinition::new(JobKey::named("test"), "stubborn");
    job.disallow_concurrent_execution = true;
    let mut trigger = every_minute("test", "test");
    trigger.schedule = Schedule::Interval {
        every_ms: 1_000,
        repeat_count: None,
    };
    first.schedule_job(&job, &trigger).unwrap();
    first.start().await.unwrap();

    assert!(wait_for(Duration::from_secs(5), || stubborn.runs.load(Ordering::SeqCst) == 1).await);
    assert!(
        wait_for(Duration::from_secs(5), || {
            first.get_trigger_state(&TriggerKey::named("test")).unwrap() == TriggerStatus::Blocked
        })
        .await
    );
    // fail over: the running job never reports back
    first.shutdown(false).await.unwrap();

    assert_eq!(
        first.get_trigger_state(&TriggerKey::named("test")).unwrap(),
        TriggerStatus::Blocked
    );
    let in_flight: Vec<_> = first
        .store()
        .fired_records()
        .unwrap()
        .into_iter()
        .filter(|r| r.trigger_key == TriggerKey::named("test"))
        .collect();
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].state, FiredState::Executing);
    assert_eq!(stubborn.runs.load(Ordering::SeqCst), 1);

    // down for longer than the misfire threshold
    stubborn.hang.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let recovery = open(&cfg);
    recovery.start().await.unwrap();
    assert!(wait_for(Duration::from_secs(5), || stubborn.runs.load(Ordering::SeqCst) >= 2).await);
    recovery.shutdown(true).await.unwrap();

    let state = recovery.get_trigger_state(&TriggerKey::named("test")).unwrap();
    assert!(
        matches!(state, TriggerStatus::Waiting | TriggerStatus::Acquired),
        "trigger left in {state}"
    );
    assert!(recovery
        .store()
        .fired_records()
        .unwrap()
        .iter()
        .all(|r| r.entry_id != in_flight[0].entry_id));
}

#[tokio::test]
async fn two_engines_on_one_database_fire_each_trigger_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let recorder = Arc::new(Recorder::default());
    let jobs = registry_with("record", recorder.clone());

    let node = |instance: &str| {
        let mut cfg = config(instance);
        cfg.cluster.clustered = true;
        let conn = open_connection(&path, Duration::from_secs(5)).unwrap();
        SchedulerEngine::new(conn, &cfg, Arc::clone(&jobs)).unwrap()
    };
    let a = node("node-a");
    let b = node("node-b");

    let at = now_ms() + chrono::Duration::milliseconds(300);
    let mut job = JobDefinition::new(JobKey::named("shared"), "record");
    job.durable = true;
    a.add_job(&job, false).unwrap();
    for i in 0..10 {
        a.schedule_trigger(&once(&format!("t{i}"), "shared", at)).unwrap();
    }
    a.start().await.unwrap();
    b.start().await.unwrap();

    assert!(wait_for(Duration::from_secs(10), || recorder.count() == 10).await);
    // give a duplicate firing the chance to show up
    tokio::time::sleep(Duration::from_millis(500)).await;
    a.shutdown(true).await.unwrap();
    b.shutdown(true).await.unwrap();

    let mut fired: Vec<String> = recorder
        .runs
        .lock()
        .unwrap()
        .iter()
        .map(|run| run.trigger_key.to_string())
        .collect();
    assert_eq!(fired.len(), 10);
    fired.sort();
    fired.dedup();
    assert_eq!(fired.len(), 10);
    assert!(a.store().fired_records().unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_firing_is_recovered_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let at = now_ms();

    let recorder = Arc::new(Recorder::default());
    let engine = engine(&path, "node-1", registry_with("record", recorder.clone()));
    let mut job = JobDefinition::new(JobKey::named("billing"), "record");
    job.requests_recovery = true;
    engine.schedule_job(&job, &once("nightly", "billing", at)).unwrap();

    assert_eq!(fire_and_crash(&path, "node-1"), 1);
    assert_eq!(engine.store().fired_records().unwrap().len(), 1);

    engine.start().await.unwrap();
    assert!(wait_for(Duration::from_secs(5), || recorder.count() == 1).await);
    engine.shutdown(true).await.unwrap();

    let run = recorder.runs.lock().unwrap()[0].clone();
    assert!(run.recovering);
    assert_eq!(run.job_key, JobKey::named("billing"));
    assert_eq!(run.scheduled_fire_time, at);
    assert_eq!(recorder.count(), 1);
    assert!(engine.store().fired_records().unwrap().is_empty());
}

#[tokio::test]
async fn removed_trigger_is_not_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");

    let recorder = Arc::new(Recorder::default());
    let engine = engine(&path, "node-1", registry_with("record", recorder.clone()));
    let mut job = JobDefinition::new(JobKey::named("billing"), "record");
    job.requests_recovery = true;
    engine.schedule_job(&job, &once("nightly", "billing", now_ms())).unwrap();

    assert_eq!(fire_and_crash(&path, "node-1"), 1);
    assert!(engine.unschedule_job(&TriggerKey::named("nightly")).unwrap());

    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.shutdown(true).await.unwrap();

    assert_eq!(recorder.count(), 0);
    assert!(engine.store().fired_records().unwrap().is_empty());
    assert!(engine.store().list_triggers().unwrap().is_empty());
}

#[tokio::test]
async fn shutdown_releases_acquired_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let recorder = Arc::new(Recorder::default());
    let conn = open_connection(&path, Duration::from_secs(5)).unwrap();
    let mut cfg = config("node-1");
    cfg.scheduler.lookahead_ms = 5_000;
    let engine = SchedulerEngine::new(conn, &cfg, registry_with("record", recorder.clone())).unwrap();

    let at = now_ms() + chrono::Duration::seconds(3);
    engine
        .schedule_job(&JobDefinition::new(JobKey::named("j"), "record"), &once("t", "j", at))
        .unwrap();
    engine.start().await.unwrap();

    assert!(
        wait_for(Duration::from_secs(2), || {
            engine.get_trigger_state(&TriggerKey::named("t")).unwrap() == TriggerStatus::Acquired
        })
        .await
    );
    engine.shutdown(false).await.unwrap();

    assert_eq!(
        engine.get_trigger_state(&TriggerKey::named("t")).unwrap(),
        TriggerStatus::Waiting
    );
    let trigger = engine.get_trigger(&TriggerKey::named("t")).unwrap().unwrap();
    assert_eq!(trigger.next_fire_time, Some(at));
    assert_eq!(trigger.times_triggered, 0);
    assert!(engine.store().fired_records().unwrap().is_empty());
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn unscheduled_trigger_does_not_fire_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let recorder = Arc::new(Recorder::default());
    let jobs = registry_with("record", recorder.clone());

    let first = engine(&path, "node-1", Arc::clone(&jobs));
    let mut trigger = every_minute("t", "j");
    trigger.start_time = now_ms() + chrono::Duration::milliseconds(1_500);
    first
        .schedule_job(&JobDefinition::new(JobKey::named("j"), "record"), &trigger)
        .unwrap();
    first.start().await.unwrap();
    first.shutdown(true).await.unwrap();
    assert!(first.unschedule_job(&TriggerKey::named("t")).unwrap());
    drop(first);

    let second = engine(&path, "node-1", jobs);
    second.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    second.shutdown(true).await.unwrap();

    assert_eq!(recorder.count(), 0);
    assert!(second.get_trigger(&TriggerKey::named("t")).unwrap().is_none());
}

#[tokio::test]
async fn paused_job_does_not_fire_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let recorder = Arc::new(Recorder::default());
    let engine = engine(&path, "node-1", registry_with("record", recorder.clone()));

    engine
        .schedule_job(&JobDefinition::new(JobKey::named("j"), "record"), &every_minute("t", "j"))
        .unwrap();
    assert!(engine.pause_job(&JobKey::named("j")).unwrap());
    engine.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count(), 0);
    assert_eq!(
        engine.get_trigger_state(&TriggerKey::named("t")).unwrap(),
        TriggerStatus::Paused
    );

    assert!(engine.resume_job(&JobKey::named("j")).unwrap());
    assert!(wait_for(Duration::from_secs(5), || recorder.count() == 1).await);
    engine.shutdown(true).await.unwrap();
}
