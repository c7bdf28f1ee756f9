//! Task steps
//!
//! Runs a user command in a fresh container. The container is keyed by the
//! build session, which is how a task survives an ATC restart: on rebind,
//! an existing container either replays its recorded exit status or hands
//! back the still-running process to re-attach to.

use crate::config_source::TaskConfigSource;
use crate::resource::{read_single_file, ContainerDestination, Session, RESOURCES_DIR};
use crate::signals::{Ready, Signal, Signals};
use crate::{
    ArtifactDestination, ArtifactSource, ExecError, ExitStatus, FailureReporter, FailureSink,
    ScopedDestination, SourceName, SourceRepository, Step, StepFactory, Success, TaskDelegate,
};
use async_trait::async_trait;
use atc_worker::{
    Container, ContainerSpec, Process, ProcessIo, ProcessSignal, ProcessSpec, TarStream, Worker,
    WorkerError, EXIT_STATUS_PROPERTY, TASK_PROCESS_PROPERTY,
};
use std::any::Any;
use std::sync::{Arc, Mutex};

/// Factory for a task step.
pub struct TaskStepFactory {
    worker: Arc<dyn Worker>,
    session: Session,
    source_name: SourceName,
    config_source: Arc<dyn TaskConfigSource>,
    privileged: bool,
    delegate: Arc<dyn TaskDelegate>,
}

impl TaskStepFactory {
    pub fn new(
        worker: Arc<dyn Worker>,
        session: Session,
        source_name: SourceName,
        config_source: Arc<dyn TaskConfigSource>,
        privileged: bool,
        delegate: Arc<dyn TaskDelegate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker,
            session,
            source_name,
            config_source,
            privileged,
            delegate,
        })
    }
}

impl StepFactory for TaskStepFactory {
    fn using(&self, _prev: Arc<dyn Step>, repo: Arc<SourceRepository>) -> Arc<dyn Step> {
        let step = Arc::new(TaskStep {
            worker: self.worker.clone(),
            session: self.session.clone(),
            source_name: self.source_name.clone(),
            config_source: self.config_source.clone(),
            privileged: self.privileged,
            delegate: self.delegate.clone(),
            repo,
            state: Mutex::new(State::default()),
        });

        FailureReporter::wrap(step, Arc::new(TaskFailure(self.delegate.clone())))
    }
}

struct TaskFailure(Arc<dyn TaskDelegate>);

#[async_trait]
impl FailureSink for TaskFailure {
    async fn failed(&self, err: &ExecError) {
        self.0.failed(err).await;
    }
}

#[derive(Default)]
struct State {
    container: Option<Arc<dyn Container>>,
    exit_status: Option<i32>,
}

struct TaskStep {
    worker: Arc<dyn Worker>,
    session: Session,
    source_name: SourceName,
    config_source: Arc<dyn TaskConfigSource>,
    privileged: bool,
    delegate: Arc<dyn TaskDelegate>,
    repo: Arc<SourceRepository>,
    state: Mutex<State>,
}

impl TaskStep {
    /// Waits for the process, honouring signals. On exit the delegate hears
    /// `finished` before the exit status is persisted to the container.
    async fn finish(
        &self,
        container: &Arc<dyn Container>,
        mut process: Box<dyn Process>,
        mut signals: Signals,
    ) -> Result<(), ExecError> {
        enum Outcome {
            Exited(Result<i32, WorkerError>),
            Signalled(Signal),
        }

        let outcome = tokio::select! {
            status = process.wait() => Outcome::Exited(status),
            signal = signals.recv() => Outcome::Signalled(signal),
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = status?;
                self.delegate.finished(ExitStatus(status)).await;
                container
                    .set_property(EXIT_STATUS_PROPERTY, &status.to_string())
                    .await?;
                lock(&self.state).exit_status = Some(status);
                Ok(())
            }
            Outcome::Signalled(signal) => {
                let process_signal = match signal {
                    Signal::Interrupt => ProcessSignal::Interrupt,
                    Signal::Terminate => ProcessSignal::Terminate,
                };
                let _ = process.signal(process_signal).await;
                let _ = container.stop(false).await;
                let _ = process.wait().await;
                Err(ExecError::Interrupted)
            }
        }
    }

    fn io(&self) -> ProcessIo {
        ProcessIo {
            stdin: None,
            stdout: Some(self.delegate.stdout()),
            stderr: Some(self.delegate.stderr()),
        }
    }
}

#[async_trait]
impl ArtifactSource for TaskStep {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        let container = lock(&self.state).container.clone();
        let Some(container) = container else {
            return Ok(());
        };

        let stream = container
            .stream_out(RESOURCES_DIR)
            .await
            .map_err(ExecError::Worker)?;
        destination.stream_in(".", stream).await
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        let container = lock(&self.state).container.clone();
        let Some(container) = container else {
            return Err(ExecError::FileNotFound(path.to_string()));
        };

        let stream = container
            .stream_out(&crate::resource::join_path(RESOURCES_DIR, path))
            .await
            .map_err(ExecError::Worker)?;
        let bytes = atc_worker::collect_stream(stream)
            .await
            .map_err(ExecError::Worker)?;
        read_single_file(&bytes, path)
    }
}

#[async_trait]
impl Step for TaskStep {
    async fn run(&self, signals: Signals, mut ready: Ready) -> Result<(), ExecError> {
        let handle = self.session.handle();

        match self.worker.lookup(&handle).await {
            Ok(container) => {
                lock(&self.state).container = Some(container.clone());

                // a recorded exit status means the task already ran to
                // completion while we were away; replay it silently
                if let Some(status) = container.get_property(EXIT_STATUS_PROPERTY).await? {
                    let status = parse_decimal(&status)?;
                    lock(&self.state).exit_status = Some(status);
                    ready.notify();
                } else {
                    let pid = container
                        .get_property(TASK_PROCESS_PROPERTY)
                        .await?
                        .ok_or_else(|| {
                            WorkerError::OperationFailed(
                                "container has no recorded task process".to_string(),
                            )
                        })?;
                    let pid = parse_decimal(&pid)? as u32;

                    let process = container.attach(pid, self.io()).await?;
                    ready.notify();

                    self.finish(&container, process, signals).await?;
                }
            }

            Err(WorkerError::ContainerNotFound(_)) => {
                let config = self.config_source.fetch_config(&self.repo).await?;
                self.delegate.initializing(&config).await;

                // resolve every declared input before creating anything
                let mut staged = Vec::with_capacity(config.inputs.len());
                let mut missing = Vec::new();
                for input in &config.inputs {
                    match self.repo.source_for(&input.name) {
                        Some(source) => staged.push((input.clone(), source)),
                        None => missing.push(input.name.clone()),
                    }
                }
                if !missing.is_empty() {
                    return Err(ExecError::MissingInputs(missing));
                }

                let container = self
                    .worker
                    .create(ContainerSpec {
                        handle: handle.clone(),
                        root_fs: config.image.clone(),
                        tags: config.tags.clone(),
                        privileged: self.privileged,
                        ..ContainerSpec::default()
                    })
                    .await?;
                lock(&self.state).container = Some(container.clone());

                // guarantee the working directory exists even with no inputs
                container.stream_in(RESOURCES_DIR, empty_tar()?).await?;

                let working_dir = ContainerDestination::new(container.clone(), RESOURCES_DIR);
                for (input, source) in staged {
                    source
                        .stream_to(&ScopedDestination::new(&working_dir, input.destination()))
                        .await?;
                }

                let process = container
                    .run(
                        ProcessSpec {
                            path: config.run.path.clone(),
                            args: config.run.args.clone(),
                            env: config
                                .params
                                .iter()
                                .map(|(k, v)| format!("{k}={v}"))
                                .collect(),
                            dir: RESOURCES_DIR.to_string(),
                            privileged: self.privileged,
                            tty: true,
                        },
                        self.io(),
                    )
                    .await?;

                container
                    .set_property(TASK_PROCESS_PROPERTY, &process.id().to_string())
                    .await?;

                self.delegate.started().await;
                ready.notify();

                self.finish(&container, process, signals).await?;
            }

            Err(err) => return Err(err.into()),
        }

        let container = lock(&self.state).container.clone();
        if let Some(container) = container {
            self.repo
                .register_source(self.source_name.clone(), Arc::new(TaskArtifact { container }));
        }

        Ok(())
    }

    async fn release(&self) {
        let container = lock(&self.state).container.take();
        if let Some(container) = container {
            if let Err(err) = self.worker.destroy(container.handle()).await {
                tracing::warn!(handle = %container.handle(), %err, "failed to destroy task container");
            }
        }
    }

    fn result(&self, out: &mut dyn Any) -> bool {
        let Some(status) = lock(&self.state).exit_status else {
            return false;
        };

        if let Some(success) = out.downcast_mut::<Success>() {
            *success = Success(status == 0);
            return true;
        }
        if let Some(exit) = out.downcast_mut::<ExitStatus>() {
            *exit = ExitStatus(status);
            return true;
        }

        false
    }
}

/// The task's working directory, readable as an artifact after completion.
struct TaskArtifact {
    container: Arc<dyn Container>,
}

#[async_trait]
impl ArtifactSource for TaskArtifact {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        let stream = self
            .container
            .stream_out(RESOURCES_DIR)
            .await
            .map_err(ExecError::Worker)?;
        destination.stream_in(".", stream).await
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        let stream = self
            .container
            .stream_out(&crate::resource::join_path(RESOURCES_DIR, path))
            .await
            .map_err(ExecError::Worker)?;
        let bytes = atc_worker::collect_stream(stream)
            .await
            .map_err(ExecError::Worker)?;
        read_single_file(&bytes, path)
    }
}

/// A tar archive with zero entries.
fn empty_tar() -> Result<TarStream, ExecError> {
    let builder = tar::Builder::new(Vec::new());
    let bytes = builder
        .into_inner()
        .map_err(|e| ExecError::Worker(WorkerError::Io(e)))?;
    Ok(Box::new(std::io::Cursor::new(bytes)))
}

fn parse_decimal(value: &str) -> Result<i32, ExecError> {
    value.trim().parse().map_err(|_| {
        ExecError::Worker(WorkerError::OperationFailed(format!(
            "malformed container property value '{value}'"
        )))
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
