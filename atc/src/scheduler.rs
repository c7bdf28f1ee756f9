//! Scheduler
//!
//! Decides, per job and per tick, which build to start. A tick resolves the
//! job's candidate input versions, makes sure a pending build is pinned to
//! them, applies the serial-group constraint, and hands eligible builds to
//! the engine. The job's advisory lock covers the decision only; builds run
//! lock-free.

use crate::engine::Engine;
use anyhow::{Context, Result};
use atc_core::{Build, BuildInput, BuildStatus, JobConfig, PipelineConfig};
use atc_db::{Db, Locker};
use atc_exec::{Signal, SignalHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Running builds, keyed by id, so signals can reach their root steps.
#[derive(Default)]
pub struct BuildTracker {
    running: Mutex<HashMap<i64, SignalHandle>>,
}

impl BuildTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, build_id: i64, handle: SignalHandle) {
        self.lock().insert(build_id, handle);
    }

    pub fn remove(&self, build_id: i64) {
        self.lock().remove(&build_id);
    }

    /// Signals a running build. Returns false when the build is not (or no
    /// longer) tracked here.
    pub fn abort(&self, build_id: i64, signal: Signal) -> bool {
        match self.lock().get(&build_id) {
            Some(handle) => {
                handle.signal(signal);
                true
            }
            None => false,
        }
    }

    /// Interrupts every running build (shutdown drain).
    pub fn interrupt_all(&self) {
        for handle in self.lock().values() {
            handle.signal(Signal::Interrupt);
        }
    }

    pub fn running_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, SignalHandle>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Scheduler {
    db: Arc<dyn Db>,
    locker: Arc<dyn Locker>,
    engine: Arc<Engine>,
    tracker: Arc<BuildTracker>,
    pipeline: PipelineConfig,
    noop: bool,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Db>,
        locker: Arc<dyn Locker>,
        engine: Arc<Engine>,
        tracker: Arc<BuildTracker>,
        pipeline: PipelineConfig,
        noop: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            locker,
            engine,
            tracker,
            pipeline,
            noop,
        })
    }

    /// One scheduling pass for a job. Returns the id of the build it
    /// started, if any.
    pub async fn tick(&self, job: &JobConfig) -> Result<Option<i64>> {
        let Some(lease) = self
            .locker
            .try_acquire_scheduling_lock(&job.name)
            .await
            .context("failed to acquire scheduling lock")?
        else {
            debug!(job = %job.name, "scheduling lock is taken, skipping tick");
            return Ok(None);
        };

        let result = self.tick_locked(job).await;
        lease.release().await;
        result
    }

    async fn tick_locked(&self, job: &JobConfig) -> Result<Option<i64>> {
        let declared = job.inputs();
        if declared.is_empty() {
            // get-less jobs gain builds only on demand, but a tick still
            // starts the next pending one once its serial group frees up
            return match self.db.next_pending_build(&job.name).await? {
                Some(build) => {
                    let inputs = self.db.build_inputs(build.id).await?;
                    self.try_start(job, build, inputs).await
                }
                None => Ok(None),
            };
        }

        let Some(inputs) = self
            .db
            .latest_input_versions(&declared)
            .await
            .context("failed to resolve input versions")?
        else {
            debug!(job = %job.name, "no candidate versions for every input");
            return Ok(None);
        };

        let build = match self.db.pending_build_for_inputs(&job.name, &inputs).await? {
            Some(existing) => existing,
            None => {
                let build = self.db.create_build(Some(&job.name)).await?;
                self.db.save_build_inputs(build.id, &inputs).await?;
                info!(job = %job.name, build = build.id, "created pending build");
                build
            }
        };

        self.try_start(job, build, inputs).await
    }

    /// Starts a build on demand, bypassing the duplicate-pending check.
    pub async fn trigger(&self, job: &JobConfig) -> Result<Build> {
        let declared = job.inputs();
        let inputs = if declared.is_empty() {
            Vec::new()
        } else {
            self.db
                .latest_input_versions(&declared)
                .await?
                .context("no candidate versions for every input")?
        };

        let build = self.db.create_build(Some(&job.name)).await?;
        self.db.save_build_inputs(build.id, &inputs).await?;
        info!(job = %job.name, build = build.id, "manually triggered build");

        self.try_start(job, build.clone(), inputs).await?;
        self.db.get_build(build.id).await.map_err(Into::into)
    }

    /// Ticks every job declaring the resource as a triggering input.
    pub async fn resource_updated(&self, resource: &str) {
        for job in &self.pipeline.jobs {
            let triggers = job
                .inputs()
                .iter()
                .any(|input| input.resource == resource && input.trigger);
            if !triggers {
                continue;
            }

            if let Err(err) = self.tick(job).await {
                error!(job = %job.name, %err, "failed to schedule after new version");
            }
        }
    }

    /// Interrupts a running build, or marks a not-yet-running one aborted.
    pub async fn abort_build(&self, build_id: i64) -> Result<()> {
        if self.tracker.abort(build_id, Signal::Interrupt) {
            return Ok(());
        }

        let build = self.db.get_build(build_id).await?;
        if !build.status.is_terminal() {
            self.db
                .save_build_status(build_id, BuildStatus::Aborted)
                .await?;
        }
        Ok(())
    }

    async fn try_start(
        &self,
        job: &JobConfig,
        build: Build,
        inputs: Vec<BuildInput>,
    ) -> Result<Option<i64>> {
        if self.noop {
            return Ok(None);
        }

        if job.is_serial() {
            let groups = job.serial_group_names();

            let running = self.db.running_builds_in_serial_groups(&groups).await?;
            if !running.is_empty() {
                debug!(job = %job.name, build = build.id, "serial group is busy");
                return Ok(None);
            }

            match self.db.next_pending_build_in_serial_groups(&groups).await? {
                Some(next) if next.id == build.id => {}
                _ => {
                    debug!(job = %job.name, build = build.id, "not the next pending build in group");
                    return Ok(None);
                }
            }
        }

        if !self.db.schedule_build(build.id).await? {
            return Ok(None);
        }

        info!(job = %job.name, build = build.id, "starting build");

        let engine = self.engine.clone();
        let job = job.clone();
        let build_id = build.id;
        tokio::spawn(async move {
            engine.run_build(build, job, inputs).await;
        });

        Ok(Some(build_id))
    }

    /// Spawns the per-job scheduling loops. Each loop ticks at the given
    /// interval until the drain channel fires.
    pub fn spawn_loops(
        self: &Arc<Self>,
        interval: Duration,
        drain: &watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.pipeline
            .jobs
            .iter()
            .cloned()
            .map(|job| {
                let scheduler = self.clone();
                let mut drain = drain.clone();

                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if let Err(err) = scheduler.tick(&job).await {
                                    error!(job = %job.name, %err, "scheduling tick failed");
                                }
                            }
                            _ = drain.changed() => {
                                debug!(job = %job.name, "scheduler loop draining");
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atc_core::{PlanConfig, ResourceConfig, Source, TaskConfig, TaskRunConfig, Version};
    use atc_db::MemoryDb;
    use atc_exec::factory::{BuildFactory, ExecFactory};
    use atc_exec::{ResourceMapping, Tracker};
    use atc_worker::fakes::{FakeWorker, ProcessStub};
    use atc_worker::Worker;

    struct Harness {
        worker: Arc<FakeWorker>,
        db: Arc<MemoryDb>,
        scheduler: Arc<Scheduler>,
        tracker: Arc<BuildTracker>,
    }

    async fn harness(pipeline: PipelineConfig, noop: bool) -> Harness {
        let worker = FakeWorker::new();
        let db = MemoryDb::new();

        for job in &pipeline.jobs {
            db.register_job(&job.name, &job.serial_group_names())
                .await
                .unwrap();
        }
        for resource in &pipeline.resources {
            db.register_resource(&resource.name).await.unwrap();
        }

        let resource_tracker = Tracker::new(
            ResourceMapping::from([("t1".to_string(), "img1".to_string())]),
            worker.clone() as Arc<dyn Worker>,
        );
        let exec = ExecFactory::new(resource_tracker, worker.clone() as Arc<dyn Worker>);
        let build_factory = BuildFactory::new(pipeline.resources.clone(), exec);

        let tracker = BuildTracker::new();
        let engine = Engine::new(db.clone(), build_factory, tracker.clone());

        let scheduler = Scheduler::new(
            db.clone(),
            db.clone(),
            engine,
            tracker.clone(),
            pipeline,
            noop,
        );

        Harness {
            worker,
            db,
            scheduler,
            tracker,
        }
    }

    fn version(v: &str) -> Version {
        Version::from([("v".to_string(), v.to_string())])
    }

    fn echo_task() -> PlanConfig {
        PlanConfig {
            task: Some("echo".to_string()),
            config: Some(TaskConfig {
                platform: "linux".to_string(),
                image: "img2".to_string(),
                run: TaskRunConfig {
                    path: "/bin/echo".to_string(),
                    args: vec!["hello".to_string()],
                },
                ..TaskConfig::default()
            }),
            ..PlanConfig::default()
        }
    }

    fn get_then_task_pipeline(serial: bool) -> PipelineConfig {
        PipelineConfig {
            resource_types: Vec::new(),
            resources: vec![ResourceConfig {
                name: "r1".to_string(),
                resource_type: "t1".to_string(),
                source: Source::new(),
            }],
            jobs: vec![JobConfig {
                name: "j".to_string(),
                serial,
                plan: vec![
                    PlanConfig {
                        get: Some("r1".to_string()),
                        trigger: true,
                        ..PlanConfig::default()
                    },
                    echo_task(),
                ],
                ..JobConfig::default()
            }],
        }
    }

    async fn wait_for_terminal(db: &Arc<MemoryDb>, build_id: i64) -> BuildStatus {
        for _ in 0..200 {
            let build = db.get_build(build_id).await.unwrap();
            if build.status.is_terminal() {
                return build.status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("build {build_id} never reached a terminal status");
    }

    #[tokio::test]
    async fn test_tick_schedules_and_runs_a_build() {
        let h = harness(get_then_task_pipeline(false), false).await;
        let job = h.scheduler.pipeline.jobs[0].clone();

        h.db.save_version("r1", &version("1")).await.unwrap();
        h.worker.stub_process_for(
            "atc-build-1-get-r1",
            ProcessStub::with_stdout(r#"{"version": {"v": "1"}}"#),
        );

        let started = h.scheduler.tick(&job).await.unwrap();
        assert_eq!(started, Some(1));

        let status = wait_for_terminal(&h.db, 1).await;
        assert_eq!(status, BuildStatus::Succeeded);

        // inputs were pinned at scheduling time
        let inputs = h.db.build_inputs(1).await.unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].resource, "r1");
        assert_eq!(inputs[0].version, version("1"));

        // the task really ran in its container
        let task = h.worker.container("atc-build-1-task-echo");
        assert!(task.is_none(), "task container should be destroyed on release");
        assert!(h
            .worker
            .destroyed_handles()
            .contains(&"atc-build-1-task-echo".to_string()));
    }

    #[tokio::test]
    async fn test_tick_does_not_duplicate_pending_builds() {
        let h = harness(get_then_task_pipeline(false), true).await;
        let job = h.scheduler.pipeline.jobs[0].clone();

        h.db.save_version("r1", &version("1")).await.unwrap();

        // noop mode: builds are created but never started
        h.scheduler.tick(&job).await.unwrap();
        h.scheduler.tick(&job).await.unwrap();
        h.scheduler.tick(&job).await.unwrap();

        assert_eq!(h.db.all_builds().len(), 1);

        // a new version yields a new pending build
        h.db.save_version("r1", &version("2")).await.unwrap();
        h.scheduler.tick(&job).await.unwrap();
        assert_eq!(h.db.all_builds().len(), 2);
    }

    #[tokio::test]
    async fn test_tick_without_candidates_does_nothing() {
        let h = harness(get_then_task_pipeline(false), false).await;
        let job = h.scheduler.pipeline.jobs[0].clone();

        // no versions observed yet
        let started = h.scheduler.tick(&job).await.unwrap();
        assert_eq!(started, None);
        assert!(h.db.all_builds().is_empty());
    }

    #[tokio::test]
    async fn test_noop_never_starts_builds() {
        let h = harness(get_then_task_pipeline(false), true).await;
        let job = h.scheduler.pipeline.jobs[0].clone();

        h.db.save_version("r1", &version("1")).await.unwrap();
        let started = h.scheduler.tick(&job).await.unwrap();

        assert_eq!(started, None);
        let build = h.db.get_build(1).await.unwrap();
        assert_eq!(build.status, BuildStatus::Pending);
        assert!(!build.scheduled);
    }

    #[tokio::test]
    async fn test_serial_group_admits_one_build_at_a_time() {
        // two jobs sharing one group, each with a blocking task
        let pipeline = PipelineConfig {
            resource_types: Vec::new(),
            resources: Vec::new(),
            jobs: vec![
                JobConfig {
                    name: "a".to_string(),
                    serial_groups: vec!["g".to_string()],
                    plan: vec![echo_task()],
                    ..JobConfig::default()
                },
                JobConfig {
                    name: "b".to_string(),
                    serial_groups: vec!["g".to_string()],
                    plan: vec![echo_task()],
                    ..JobConfig::default()
                },
            ],
        };
        let h = harness(pipeline, false).await;
        let job_a = h.scheduler.pipeline.jobs[0].clone();
        let job_b = h.scheduler.pipeline.jobs[1].clone();

        // both tasks hang until their container is stopped
        h.worker.stub_process_for(
            "atc-build-1-task-echo",
            ProcessStub {
                blocks_until_stopped: true,
                ..ProcessStub::default()
            },
        );

        let build_a = h.scheduler.trigger(&job_a).await.unwrap();
        let build_b = h.scheduler.trigger(&job_b).await.unwrap();
        assert!(build_a.id < build_b.id);

        // wait for a's engine task to pick up
        for _ in 0..200 {
            if h.tracker.running_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stored_a = h.db.get_build(build_a.id).await.unwrap();
        let stored_b = h.db.get_build(build_b.id).await.unwrap();
        assert!(stored_a.scheduled);
        assert!(!stored_b.scheduled, "b must wait for the group");
        assert_eq!(stored_b.status, BuildStatus::Pending);

        // finish a, then b becomes eligible on its next tick
        h.scheduler.abort_build(build_a.id).await.unwrap();
        wait_for_terminal(&h.db, build_a.id).await;

        let started = h.scheduler.tick(&job_b).await.unwrap();
        assert_eq!(started, Some(build_b.id));
        wait_for_terminal(&h.db, build_b.id).await;
    }

    #[tokio::test]
    async fn test_serial_group_starts_oldest_pending_first() {
        let pipeline = PipelineConfig {
            resource_types: Vec::new(),
            resources: Vec::new(),
            jobs: vec![
                JobConfig {
                    name: "a".to_string(),
                    serial_groups: vec!["g".to_string()],
                    plan: vec![echo_task()],
                    ..JobConfig::default()
                },
                JobConfig {
                    name: "b".to_string(),
                    serial_groups: vec!["g".to_string()],
                    plan: vec![echo_task()],
                    ..JobConfig::default()
                },
            ],
        };
        let h = harness(pipeline, true).await;
        let job_a = h.scheduler.pipeline.jobs[0].clone();
        let job_b = h.scheduler.pipeline.jobs[1].clone();

        // noop creates both pending builds without starting either
        let build_a = h.scheduler.trigger(&job_a).await.unwrap();
        let build_b = h.scheduler.trigger(&job_b).await.unwrap();

        // a non-noop scheduler over the same database
        let worker = FakeWorker::new();
        let tracker = BuildTracker::new();
        let engine = Engine::new(
            h.db.clone(),
            BuildFactory::new(
                Vec::new(),
                ExecFactory::new(
                    Tracker::new(ResourceMapping::new(), worker.clone() as Arc<dyn Worker>),
                    worker.clone() as Arc<dyn Worker>,
                ),
            ),
            tracker.clone(),
        );
        let scheduler = Scheduler::new(
            h.db.clone(),
            h.db.clone(),
            engine,
            tracker,
            PipelineConfig::default(),
            false,
        );

        // ticking the younger build's job first still starts the older one
        let started = scheduler.tick(&job_b).await.unwrap();
        assert_eq!(started, None);

        let stored_b = h.db.get_build(build_b.id).await.unwrap();
        assert!(!stored_b.scheduled);

        let started = scheduler.tick(&job_a).await.unwrap();
        assert_eq!(started, Some(build_a.id));
    }

    #[tokio::test]
    async fn test_trigger_runs_a_get_less_job() {
        let pipeline = PipelineConfig {
            resource_types: Vec::new(),
            resources: Vec::new(),
            jobs: vec![JobConfig {
                name: "oneshot".to_string(),
                plan: vec![echo_task()],
                ..JobConfig::default()
            }],
        };
        let h = harness(pipeline, false).await;
        let job = h.scheduler.pipeline.jobs[0].clone();

        // ticks never create builds for a job with no declared inputs
        assert_eq!(h.scheduler.tick(&job).await.unwrap(), None);
        assert!(h.db.all_builds().is_empty());

        let build = h.scheduler.trigger(&job).await.unwrap();
        let status = wait_for_terminal(&h.db, build.id).await;
        assert_eq!(status, BuildStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_abort_of_a_pending_build() {
        let h = harness(get_then_task_pipeline(false), true).await;
        let job = h.scheduler.pipeline.jobs[0].clone();

        h.db.save_version("r1", &version("1")).await.unwrap();
        h.scheduler.tick(&job).await.unwrap();

        h.scheduler.abort_build(1).await.unwrap();
        let build = h.db.get_build(1).await.unwrap();
        assert_eq!(build.status, BuildStatus::Aborted);
    }

    #[tokio::test]
    async fn test_resource_updated_only_ticks_triggering_jobs() {
        let mut pipeline = get_then_task_pipeline(false);
        pipeline.jobs.push(JobConfig {
            name: "passive".to_string(),
            plan: vec![PlanConfig {
                get: Some("r1".to_string()),
                trigger: false,
                ..PlanConfig::default()
            }],
            ..JobConfig::default()
        });

        let h = harness(pipeline, true).await;

        h.db.save_version("r1", &version("1")).await.unwrap();
        h.scheduler.resource_updated("r1").await;

        let builds = h.db.all_builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].job_name.as_deref(), Some("j"));
    }
}
