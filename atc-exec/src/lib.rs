//! ATC Exec
//!
//! The step engine: a build executes as a tree of composable, signalable
//! steps that get and put resources, run containerised tasks, and exchange
//! artifacts through a per-build source repository.
//!
//! A `StepFactory` is an unbound step kind; binding it to a previous step
//! and a repository yields a running `Step`: a suspendable runnable with
//! release, typed result extraction and the two artifact operations.

pub mod aggregate;
pub mod compose;
pub mod conditional;
pub mod config_source;
pub mod factory;
pub mod repository;
pub mod resource;
pub mod resource_step;
pub mod signals;
pub mod task_step;

#[cfg(test)]
pub(crate) mod test_support;

pub use aggregate::Aggregate;
pub use compose::Compose;
pub use conditional::Conditional;
pub use config_source::{FileConfigSource, MergedConfigSource, StaticConfigSource, TaskConfigSource};
pub use factory::{BuildDelegate, BuildFactory, ExecFactory};
pub use repository::{SourceName, SourceRepository};
pub use resource::{IoConfig, ResourceError, ResourceMapping, Session, SessionScope, Tracker};
pub use signals::{signal_channel, Ready, ReadyWaiter, Signal, SignalHandle, Signals};

use async_trait::async_trait;
use atc_core::{MetadataField, TaskConfig, TaskConfigError, Version};
use atc_worker::{OutputSink, TarStream, WorkerError};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Broad classification of a step error, deciding the final build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-visible configuration problem; the build failed.
    Config,
    /// A resource script exited nonzero; the build failed.
    Script,
    /// Container or worker trouble; the build errored.
    Infrastructure,
    /// A signal stopped the step; the build aborted.
    Interrupted,
}

/// Errors surfaced by running steps.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unknown artifact source: {0}")]
    UnknownArtifactSource(String),

    #[error("config path '{0}' does not specify where the file lives")]
    UnspecifiedArtifactSource(String),

    #[error("missing inputs: {}", .0.join(", "))]
    MissingInputs(Vec<String>),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("invalid build plan: {0}")]
    InvalidPlan(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid task configuration: {0}")]
    InvalidTaskConfig(#[from] TaskConfigError),

    #[error("failed to parse task config: {0}")]
    MalformedTaskConfig(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::UnknownArtifactSource(_)
            | ExecError::UnspecifiedArtifactSource(_)
            | ExecError::MissingInputs(_)
            | ExecError::UnknownResource(_)
            | ExecError::InvalidPlan(_)
            | ExecError::FileNotFound(_)
            | ExecError::InvalidTaskConfig(_)
            | ExecError::MalformedTaskConfig(_) => ErrorKind::Config,

            ExecError::Interrupted => ErrorKind::Interrupted,

            ExecError::Resource(err) => err.kind(),

            ExecError::Worker(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind() == ErrorKind::Interrupted
    }
}

/// A producer of artifacts, addressed inside a build by source name.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Streams the source's artifact into the destination, rooted at ".".
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError>;

    /// Reads a single file out of the source's artifact.
    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError>;
}

/// Somewhere an artifact can be streamed to, path-addressed under a root.
#[async_trait]
pub trait ArtifactDestination: Send + Sync {
    async fn stream_in(&self, dest_path: &str, tar: TarStream) -> Result<(), ExecError>;
}

/// A bound, runnable step.
#[async_trait]
pub trait Step: ArtifactSource {
    /// Runs the step. `ready` must be notified once initialisation is past;
    /// a signal arriving before that must still be honoured.
    async fn run(&self, signals: Signals, ready: Ready) -> Result<(), ExecError>;

    /// Releases whatever the step holds (containers, children). Idempotent;
    /// called exactly once by the supervisor after the build finishes.
    async fn release(&self);

    /// Typed result extraction: fills `out` and returns true iff the step
    /// produces that result kind (`VersionInfo`, `Success`, `ExitStatus`).
    fn result(&self, out: &mut dyn Any) -> bool;
}

/// An unbound step kind; binding yields the runnable step.
pub trait StepFactory: Send + Sync {
    fn using(&self, prev: Arc<dyn Step>, repo: Arc<SourceRepository>) -> Arc<dyn Step>;
}

impl std::fmt::Debug for dyn StepFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn StepFactory>")
    }
}

/// Whether the step's work succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Success(pub bool);

/// Exit status of a task's command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus(pub i32);

/// The version (and metadata) a resource step produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: Version,
    pub metadata: Vec<MetadataField>,
}

/// Receives the outcome of a resource (get/put) step and supplies the sink
/// for the script's user-visible stderr.
#[async_trait]
pub trait ResourceDelegate: Send + Sync {
    async fn completed(&self, info: VersionInfo);
    async fn failed(&self, err: &ExecError);

    fn stderr(&self) -> OutputSink;
}

/// Receives the lifecycle of a task step and supplies its output sinks.
#[async_trait]
pub trait TaskDelegate: Send + Sync {
    async fn initializing(&self, config: &TaskConfig);
    async fn started(&self);
    async fn finished(&self, exit: ExitStatus);
    async fn failed(&self, err: &ExecError);

    fn stdout(&self) -> OutputSink;
    fn stderr(&self) -> OutputSink;
}

/// A destination view rooted at a subdirectory of another destination.
///
/// Task input staging and aggregate fan-out both land artifacts under a
/// per-source directory of the real destination.
pub struct ScopedDestination<'a> {
    inner: &'a dyn ArtifactDestination,
    prefix: &'a str,
}

impl<'a> ScopedDestination<'a> {
    pub fn new(inner: &'a dyn ArtifactDestination, prefix: &'a str) -> Self {
        Self { inner, prefix }
    }
}

#[async_trait]
impl ArtifactDestination for ScopedDestination<'_> {
    async fn stream_in(&self, dest_path: &str, tar: TarStream) -> Result<(), ExecError> {
        self.inner
            .stream_in(&resource::join_path(self.prefix, dest_path), tar)
            .await
    }
}

/// A step that does nothing, reports nothing, and has no artifacts.
///
/// Serves as the previous step of a plan's first entry and as the chosen
/// branch of an unsatisfied conditional.
pub struct NoopStep;

#[async_trait]
impl ArtifactSource for NoopStep {
    async fn stream_to(&self, _destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        Ok(())
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        Err(ExecError::FileNotFound(path.to_string()))
    }
}

#[async_trait]
impl Step for NoopStep {
    async fn run(&self, _signals: Signals, mut ready: Ready) -> Result<(), ExecError> {
        ready.notify();
        Ok(())
    }

    async fn release(&self) {}

    fn result(&self, _out: &mut dyn Any) -> bool {
        false
    }
}

/// Factory producing `NoopStep`s; the zero element of composition.
pub struct NoopStepFactory;

impl StepFactory for NoopStepFactory {
    fn using(&self, _prev: Arc<dyn Step>, _repo: Arc<SourceRepository>) -> Arc<dyn Step> {
        Arc::new(NoopStep)
    }
}

/// Wraps a step so any run error is reported to a failure callback before
/// propagating. This is the only path for delegate failure reporting;
/// `completed` and `failed` are mutually exclusive.
pub struct FailureReporter {
    step: Arc<dyn Step>,
    report: Arc<dyn FailureSink>,
}

/// The failure half of a delegate.
#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn failed(&self, err: &ExecError);
}

impl FailureReporter {
    pub fn wrap(step: Arc<dyn Step>, report: Arc<dyn FailureSink>) -> Arc<dyn Step> {
        Arc::new(Self { step, report })
    }
}

#[async_trait]
impl ArtifactSource for FailureReporter {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        self.step.stream_to(destination).await
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        self.step.stream_file(path).await
    }
}

#[async_trait]
impl Step for FailureReporter {
    async fn run(&self, signals: Signals, ready: Ready) -> Result<(), ExecError> {
        match self.step.run(signals, ready).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.report.failed(&err).await;
                Err(err)
            }
        }
    }

    async fn release(&self) {
        self.step.release().await;
    }

    fn result(&self, out: &mut dyn Any) -> bool {
        self.step.result(out)
    }
}

/// Reads a step's `Success` result, presuming success when the step has no
/// opinion.
pub fn presumed_success(step: &dyn Step) -> bool {
    let mut success = Success::default();
    if step.result(&mut success) {
        success.0
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FailingStep;

    #[async_trait]
    impl ArtifactSource for FailingStep {
        async fn stream_to(&self, _d: &dyn ArtifactDestination) -> Result<(), ExecError> {
            Ok(())
        }
        async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
            Err(ExecError::FileNotFound(path.to_string()))
        }
    }

    #[async_trait]
    impl Step for FailingStep {
        async fn run(&self, _signals: Signals, mut ready: Ready) -> Result<(), ExecError> {
            ready.notify();
            Err(ExecError::MissingInputs(vec!["src".to_string()]))
        }
        async fn release(&self) {}
        fn result(&self, _out: &mut dyn Any) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FailureSink for RecordingSink {
        async fn failed(&self, err: &ExecError) {
            self.errors.lock().unwrap().push(err.to_string());
        }
    }

    #[tokio::test]
    async fn test_failure_reporter_reports_then_propagates() {
        let sink = Arc::new(RecordingSink::default());
        let step = FailureReporter::wrap(Arc::new(FailingStep), sink.clone());

        let (_handle, signals) = signal_channel();
        let err = step.run(signals, Ready::detached()).await.unwrap_err();

        assert!(matches!(err, ExecError::MissingInputs(_)));
        assert_eq!(
            sink.errors.lock().unwrap().clone(),
            vec!["missing inputs: src".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failure_reporter_silent_on_success() {
        let sink = Arc::new(RecordingSink::default());
        let step = FailureReporter::wrap(Arc::new(NoopStep), sink.clone());

        let (_handle, signals) = signal_channel();
        step.run(signals, Ready::detached()).await.unwrap();

        assert!(sink.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ExecError::MissingInputs(vec!["a".to_string()]).kind(),
            ErrorKind::Config
        );
        assert_eq!(
            ExecError::UnknownArtifactSource("x".to_string()).kind(),
            ErrorKind::Config
        );
        assert_eq!(ExecError::Interrupted.kind(), ErrorKind::Interrupted);
        assert_eq!(
            ExecError::Worker(WorkerError::ContainerNotFound("c".to_string())).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn test_presumed_success_without_result() {
        assert!(presumed_success(&NoopStep));
    }
}
