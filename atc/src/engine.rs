//! Build engine
//!
//! Runs one build to completion: compiles the job into a step tree, binds
//! it to a fresh source repository, supervises the root step, persists the
//! status transitions, and always releases the tree. The engine is the
//! single writer of a build's post-scheduling statuses.

use crate::scheduler::BuildTracker;
use async_trait::async_trait;
use atc_core::{Build, BuildInput, BuildOutput, BuildStatus, JobConfig, TaskConfig};
use atc_db::Db;
use atc_exec::factory::{BuildDelegate, BuildFactory};
use atc_exec::{
    presumed_success, signal_channel, ErrorKind, ExecError, ExitStatus, NoopStep, Ready,
    ResourceDelegate, SourceRepository, TaskDelegate, VersionInfo,
};
use atc_worker::OutputSink;
use std::sync::Arc;
use tracing::{error, info};

pub struct Engine {
    db: Arc<dyn Db>,
    build_factory: BuildFactory,
    tracker: Arc<BuildTracker>,
}

impl Engine {
    pub fn new(db: Arc<dyn Db>, build_factory: BuildFactory, tracker: Arc<BuildTracker>) -> Arc<Self> {
        Arc::new(Self {
            db,
            build_factory,
            tracker,
        })
    }

    /// Runs a scheduled build to its terminal status.
    pub async fn run_build(&self, build: Build, job: JobConfig, inputs: Vec<BuildInput>) {
        let build_id = build.id;
        info!(build = build_id, job = ?build.job_name, "executing build");

        let delegate: Arc<dyn BuildDelegate> = Arc::new(EngineBuildDelegate {
            db: self.db.clone(),
            build_id,
        });

        let tree = match self.build_factory.create(&job, build_id, &inputs, &delegate) {
            Ok(tree) => tree,
            Err(err) => {
                error!(build = build_id, %err, "failed to compile build plan");
                self.finish(build_id, status_for(&err)).await;
                return;
            }
        };

        let repo = SourceRepository::new();
        let root = tree.using(Arc::new(NoopStep), repo);

        let (signal_handle, signals) = signal_channel();
        self.tracker.register(build_id, signal_handle);

        if let Err(err) = self.db.save_build_status(build_id, BuildStatus::Started).await {
            error!(build = build_id, %err, "failed to record build start");
        }

        let (ready, waiter) = Ready::new();
        let running = {
            let root = root.clone();
            tokio::spawn(async move { root.run(signals, ready).await })
        };
        waiter.wait().await;

        let status = match running.await {
            Ok(Ok(())) => {
                if presumed_success(&*root) {
                    BuildStatus::Succeeded
                } else {
                    BuildStatus::Failed
                }
            }
            Ok(Err(err)) => {
                info!(build = build_id, %err, "build finished with error");
                status_for(&err)
            }
            Err(join_err) => {
                error!(build = build_id, %join_err, "build execution panicked");
                BuildStatus::Errored
            }
        };

        root.release().await;
        self.finish(build_id, status).await;
    }

    async fn finish(&self, build_id: i64, status: BuildStatus) {
        if let Err(err) = self.db.save_build_status(build_id, status).await {
            error!(build = build_id, %err, "failed to record build status");
        }
        self.tracker.remove(build_id);
        info!(build = build_id, %status, "build finished");
    }
}

/// The final status a step error maps to.
fn status_for(err: &ExecError) -> BuildStatus {
    match err.kind() {
        ErrorKind::Config | ErrorKind::Script => BuildStatus::Failed,
        ErrorKind::Infrastructure => BuildStatus::Errored,
        ErrorKind::Interrupted => BuildStatus::Aborted,
    }
}

/// Per-build delegate factory persisting step outcomes.
struct EngineBuildDelegate {
    db: Arc<dyn Db>,
    build_id: i64,
}

impl BuildDelegate for EngineBuildDelegate {
    fn resource_delegate(&self, step_name: &str) -> Arc<dyn ResourceDelegate> {
        Arc::new(EngineResourceDelegate {
            db: self.db.clone(),
            build_id: self.build_id,
            step_name: step_name.to_string(),
        })
    }

    fn task_delegate(&self, step_name: &str) -> Arc<dyn TaskDelegate> {
        Arc::new(EngineTaskDelegate {
            build_id: self.build_id,
            step_name: step_name.to_string(),
        })
    }
}

struct EngineResourceDelegate {
    db: Arc<dyn Db>,
    build_id: i64,
    step_name: String,
}

impl EngineResourceDelegate {
    /// `put:<resource>` steps persist their produced version as a build
    /// output; gets have their versions pinned as inputs already.
    fn output_resource(&self) -> Option<&str> {
        self.step_name.strip_prefix("put:")
    }
}

#[async_trait]
impl ResourceDelegate for EngineResourceDelegate {
    async fn completed(&self, info: VersionInfo) {
        info!(
            build = self.build_id,
            step = %self.step_name,
            version = ?info.version,
            "resource step completed"
        );

        if let Some(resource) = self.output_resource() {
            let output = BuildOutput {
                resource: resource.to_string(),
                version: info.version,
            };
            if let Err(err) = self.db.save_build_output(self.build_id, &output).await {
                error!(build = self.build_id, %err, "failed to save build output");
            }
        }
    }

    async fn failed(&self, err: &ExecError) {
        error!(build = self.build_id, step = %self.step_name, %err, "resource step failed");
    }

    fn stderr(&self) -> OutputSink {
        Box::new(BuildLogWriter::new(self.build_id, &self.step_name))
    }
}

struct EngineTaskDelegate {
    build_id: i64,
    step_name: String,
}

#[async_trait]
impl TaskDelegate for EngineTaskDelegate {
    async fn initializing(&self, config: &TaskConfig) {
        info!(
            build = self.build_id,
            step = %self.step_name,
            image = %config.image,
            "task initializing"
        );
    }

    async fn started(&self) {
        info!(build = self.build_id, step = %self.step_name, "task started");
    }

    async fn finished(&self, exit: ExitStatus) {
        info!(build = self.build_id, step = %self.step_name, exit = exit.0, "task finished");
    }

    async fn failed(&self, err: &ExecError) {
        error!(build = self.build_id, step = %self.step_name, %err, "task failed");
    }

    fn stdout(&self) -> OutputSink {
        Box::new(BuildLogWriter::new(self.build_id, &self.step_name))
    }

    fn stderr(&self) -> OutputSink {
        Box::new(BuildLogWriter::new(self.build_id, &self.step_name))
    }
}

/// Forwards build output lines into the process log. Event persistence for
/// the UI lives behind the API layer; the control plane only keeps the
/// operator-facing trace.
struct BuildLogWriter {
    build_id: i64,
    step_name: String,
}

impl BuildLogWriter {
    fn new(build_id: i64, step_name: &str) -> Self {
        Self {
            build_id,
            step_name: step_name.to_string(),
        }
    }
}

impl tokio::io::AsyncWrite for BuildLogWriter {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let text = String::from_utf8_lossy(buf);
        for line in text.lines().filter(|l| !l.is_empty()) {
            info!(
                target: "build_log",
                build = self.build_id,
                step = %self.step_name,
                "{line}"
            );
        }
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}
