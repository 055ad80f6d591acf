use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use cadence_core::CadenceConfig;
use cadence_scheduler::{
    db::open_database, Job, JobDefinition, JobExecutionContext, JobExecutionFault, JobKey,
    JobRegistry, MisfireInstruction, Schedule, SchedulerEngine, TriggerDefinition, TriggerKey,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cadence-node", about = "Persistent, clusterable job scheduler node")]
struct Cli {
    /// Config file. Falls back to CADENCE_CONFIG, then ~/.cadence/cadence.toml.
    #[arg(long, short)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register the configured jobs and run the scheduler until Ctrl-C.
    Run,
    /// Print every trigger with its state and next fire time.
    Status,
    Pause(TriggerArgs),
    Resume(TriggerArgs),
    /// Remove a trigger (and its job, if non-durable).
    Unschedule(TriggerArgs),
    /// Return an ERROR trigger to rotation.
    ResetError(TriggerArgs),
}

#[derive(clap::Args)]
struct TriggerArgs {
    name: String,
    #[arg(long, default_value = "DEFAULT")]
    group: String,
}

impl TriggerArgs {
    fn key(&self) -> TriggerKey {
        TriggerKey::new(self.group.clone(), self.name.clone())
    }
}

/// One `[[jobs]]` entry: a job and the single trigger that drives it.
#[derive(Debug, Deserialize)]
struct JobSpec {
    name: String,
    #[serde(default = "default_group")]
    group: String,
    job_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    durable: bool,
    #[serde(default)]
    disallow_concurrent_execution: bool,
    #[serde(default)]
    requests_recovery: bool,
    #[serde(default)]
    data: serde_json::Value,
    schedule: Schedule,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    misfire_instruction: MisfireInstruction,
}

#[derive(Debug, Default, Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

fn default_group() -> String {
    "DEFAULT".to_string()
}

impl JobSpec {
    fn definitions(&self) -> (JobDefinition, TriggerDefinition) {
        let key = JobKey::new(self.group.clone(), self.name.clone());
        let mut job = JobDefinition::new(key.clone(), self.job_type.clone());
        job.description = self.description.clone();
        job.durable = self.durable;
        job.disallow_concurrent_execution = self.disallow_concurrent_execution;
        job.requests_recovery = self.requests_recovery;
        job.data = self.data.clone();

        let mut trigger = TriggerDefinition::new(
            TriggerKey::new(self.group.clone(), self.name.clone()),
            key,
            self.schedule.clone(),
            chrono::Utc::now(),
        );
        trigger.misfire_instruction = self.misfire_instruction;
        if let Some(priority) = self.priority {
            trigger.priority = priority;
        }
        (job, trigger)
    }
}

/// Logs the firing and its job data.
struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobExecutionFault> {
        info!(
            job = %ctx.job_key,
            trigger = %ctx.trigger_key,
            scheduled = %ctx.scheduled_fire_time,
            recovering = ctx.recovering,
            data = %ctx.job_data,
            "job fired"
        );
        Ok(())
    }
}

/// Sleeps for `data.ms` milliseconds. Useful for exercising concurrency limits.
struct SleepJob;

#[async_trait]
impl Job for SleepJob {
    async fn execute(&self, ctx: &JobExecutionContext) -> Result<(), JobExecutionFault> {
        let ms = ctx
            .job_data
            .get("ms")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                JobExecutionFault::new("sleep job needs a numeric `ms` in its data")
                    .unschedule_firing_trigger()
            })?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }
}

fn builtin_jobs() -> Arc<JobRegistry> {
    let jobs = Arc::new(JobRegistry::new());
    jobs.register("log", Arc::new(LogJob));
    jobs.register("sleep", Arc::new(SleepJob));
    jobs
}

/// Store each configured job unless its trigger already exists.
fn register_jobs(engine: &SchedulerEngine, specs: &[JobSpec]) -> anyhow::Result<()> {
    for spec in specs {
        let (job, trigger) = spec.definitions();
        if engine.get_trigger(&trigger.key)?.is_some() {
            engine.add_job(&job, true)?;
            continue;
        }
        let stored = if engine.get_job(&job.key)?.is_some() {
            let stored = engine.schedule_trigger(&trigger)?;
            engine.add_job(&job, true)?;
            stored
        } else {
            engine.schedule_job(&job, &trigger)?
        };
        info!(
            trigger = %stored.key,
            next_fire_time = ?stored.next_fire_time,
            "job scheduled from config"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_node=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    info!(path = %config.database.path, "opening SQLite database");
    let conn = open_database(&config.database).context("opening scheduler database")?;
    let engine = SchedulerEngine::new(conn, &config, builtin_jobs())?;

    match cli.command {
        Command::Run => {
            let file: JobsFile = CadenceConfig::figment(config_path.as_deref())
                .extract()
                .context("reading [[jobs]] from config")?;
            register_jobs(&engine, &file.jobs)?;

            engine.start().await?;
            info!(instance_id = %engine.instance_id(), "cadence node running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            engine.shutdown(true).await?;
        }
        Command::Status => {
            let triggers = engine.store().list_triggers()?;
            if triggers.is_empty() {
                println!("no triggers scheduled");
            }
            for t in triggers {
                let next = t
                    .next_fire_time
                    .map(|n| n.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<32} {:<24} {:<15} next={} fired={}",
                    t.key.to_string(),
                    t.job_key.to_string(),
                    t.state.to_string(),
                    next,
                    t.times_triggered
                );
            }
            for record in engine.store().fired_records()? {
                println!(
                    "in flight: {} {} on {} ({})",
                    record.trigger_key, record.state, record.instance_id, record.fired_time
                );
            }
        }
        Command::Pause(args) => report(&args, engine.pause_trigger(&args.key())?, "paused"),
        Command::Resume(args) => report(&args, engine.resume_trigger(&args.key())?, "resumed"),
        Command::Unschedule(args) => report(&args, engine.unschedule_job(&args.key())?, "unscheduled"),
        Command::ResetError(args) => {
            report(&args, engine.reset_trigger_from_error(&args.key())?, "reset")
        }
    }
    Ok(())
}

fn report(args: &TriggerArgs, found: bool, verb: &str) {
    if found {
        println!("{} {}", args.key(), verb);
    } else {
        println!("no trigger {}", args.key());
    }
}

#[cfg(test)]
mod tests {
    use figment::{
        providers::{Format, Toml},
        Figment,
    };

    use super::*;

    #[test]
    fn job_spec_parses_from_toml() {
        let toml = r#"
            [[jobs]]
            name = "heartbeat"
            job_type = "log"
            durable = true
            schedule = { kind = "interval", every_ms = 5000 }
            data = { target = "ops" }

            [[jobs]]
            name = "nightly"
            group = "reports"
            job_type = "sleep"
            priority = 9
            misfire_instruction = "do_nothing"
            schedule = { kind = "cron", expression = "0 2 * * *" }
        "#;
        let file: JobsFile = Figment::from(Toml::string(toml)).extract().unwrap();
        assert_eq!(file.jobs.len(), 2);

        let (job, trigger) = file.jobs[0].definitions();
        assert_eq!(job.key, JobKey::named("heartbeat"));
        assert!(job.durable);
        assert_eq!(job.data["target"], "ops");
        assert_eq!(trigger.job_key, job.key);

        let (_, trigger) = file.jobs[1].definitions();
        assert_eq!(trigger.key, TriggerKey::new("reports", "nightly"));
        assert_eq!(trigger.priority, 9);
        assert_eq!(trigger.misfire_instruction, MisfireInstruction::DoNothing);
    }
}
