//! ATC
//!
//! The control plane of the CI server. Loads the pipeline, connects the
//! database, registers the configured jobs and resources, then supervises:
//! - one radar loop per resource, detecting new versions
//! - one scheduler loop per job, deciding which build to start
//! - the engine, executing builds as step trees against the worker
//!
//! An interrupt closes the drain channel: loops exit at their next
//! suspension point and running builds receive the interrupt through the
//! build tracker.

mod engine;
mod radar;
mod scheduler;

use anyhow::{Context, Result};
use atc_core::PipelineConfig;
use atc_db::{Db, Locker, MemoryDb};
use atc_exec::factory::{BuildFactory, ExecFactory};
use atc_exec::{ResourceMapping, Tracker};
use atc_worker::podman::{check_podman_available, PodmanWorker};
use atc_worker::Worker;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::engine::Engine;
use crate::radar::Radar;
use crate::scheduler::{BuildTracker, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "atc", about = "CI control plane")]
struct Args {
    /// Path to the pipeline config file.
    #[arg(long)]
    pipeline: PathBuf,

    /// Seconds between checks of each resource.
    #[arg(long, default_value_t = 60)]
    check_interval: u64,

    /// Seconds between scheduling ticks of each job.
    #[arg(long, default_value_t = 10)]
    scheduling_interval: u64,

    /// Postgres connection string. Empty runs against the in-memory store
    /// (single-node, nothing survives a restart).
    #[arg(long, env = "DATABASE_URL", default_value = "")]
    database_url: String,

    /// Save detected versions but never trigger builds.
    #[arg(long)]
    noop: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("starting ATC");

    let pipeline = load_pipeline(&args.pipeline)?;
    info!(
        resources = pipeline.resources.len(),
        jobs = pipeline.jobs.len(),
        "loaded pipeline"
    );

    let (db, locker) = connect_db(&args.database_url).await?;

    for job in &pipeline.jobs {
        db.register_job(&job.name, &job.serial_group_names())
            .await
            .with_context(|| format!("failed to register job '{}'", job.name))?;
    }
    for resource in &pipeline.resources {
        db.register_resource(&resource.name)
            .await
            .with_context(|| format!("failed to register resource '{}'", resource.name))?;
    }

    if let Err(err) = check_podman_available().await {
        warn!(%err, "worker backend unavailable; builds will error until it is");
    }
    let worker: Arc<dyn Worker> = PodmanWorker::new();

    let resource_types: ResourceMapping = pipeline
        .resource_types
        .iter()
        .map(|t| (t.name.clone(), t.image.clone()))
        .collect();

    let tracker = Tracker::new(resource_types, worker.clone());
    let exec_factory = ExecFactory::new(tracker.clone(), worker);
    let build_factory = BuildFactory::new(pipeline.resources.clone(), exec_factory);

    let build_tracker = BuildTracker::new();
    let engine = Engine::new(db.clone(), build_factory, build_tracker.clone());

    let scheduler = Scheduler::new(
        db.clone(),
        locker.clone(),
        engine,
        build_tracker.clone(),
        pipeline.clone(),
        args.noop,
    );
    let radar = Radar::new(db, locker, tracker, scheduler.clone(), args.noop);

    let (drain_tx, drain_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            let _ = drain_tx.send(true);
        }
    });

    let mut loops = radar.spawn_loops(
        &pipeline,
        Duration::from_secs(args.check_interval),
        &drain_rx,
    );
    loops.extend(scheduler.spawn_loops(
        Duration::from_secs(args.scheduling_interval),
        &drain_rx,
    ));

    info!(
        check_interval = args.check_interval,
        scheduling_interval = args.scheduling_interval,
        noop = args.noop,
        "ATC is running"
    );

    for handle in loops {
        if let Err(err) = handle.await {
            warn!(%err, "loop exited abnormally");
        }
    }

    // loops are drained; interrupt whatever is still building
    build_tracker.interrupt_all();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while build_tracker.running_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("ATC exited cleanly");
    Ok(())
}

fn load_pipeline(path: &PathBuf) -> Result<PipelineConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline file {}", path.display()))?;

    let pipeline: PipelineConfig =
        serde_yaml::from_str(&contents).context("failed to parse pipeline config")?;

    pipeline.validate().context("invalid pipeline config")?;
    Ok(pipeline)
}

async fn connect_db(database_url: &str) -> Result<(Arc<dyn Db>, Arc<dyn Locker>)> {
    if database_url.is_empty() {
        info!("no database configured, using the in-memory store");
        let db = MemoryDb::new();
        return Ok((db.clone(), db));
    }

    info!("connecting to database");
    let db = atc_db::postgres::connect_with_retry(database_url)
        .await
        .context("failed to connect to database")?;

    Ok((db.clone(), db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_pipeline_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
resource_types:
  - name: git
    image: docker:///concourse/git-resource

resources:
  - name: repo
    type: git
    source:
      uri: https://example.com/repo.git

jobs:
  - name: unit
    serial: true
    plan:
      - get: repo
        trigger: true
      - task: test
        file: repo/ci/test.yml
"#
        )
        .unwrap();

        let pipeline = load_pipeline(&file.path().to_path_buf()).unwrap();
        assert_eq!(pipeline.resource_types[0].name, "git");
        assert_eq!(pipeline.jobs[0].name, "unit");
    }

    #[test]
    fn test_load_pipeline_rejects_invalid_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
jobs:
  - name: unit
    plan:
      - get: nowhere
"#
        )
        .unwrap();

        assert!(load_pipeline(&file.path().to_path_buf()).is_err());
    }

    #[tokio::test]
    async fn test_connect_db_defaults_to_memory() {
        let (db, _locker) = connect_db("").await.unwrap();
        db.register_resource("r1").await.unwrap();
    }
}
