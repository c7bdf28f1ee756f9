//! In-memory worker doubles
//!
//! Scriptable fakes for the `Worker`/`Container`/`Process` traits. Tests
//! seed containers, queue process stubs and inspect every recorded call.
//! These are ordinary library code so downstream crates can use them from
//! their own test modules.

use crate::{
    collect_stream, Container, ContainerSpec, Process, ProcessIo, ProcessSignal, ProcessSpec,
    TarStream, Worker, WorkerError,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

/// Scripted behaviour for one process the fake container will run.
#[derive(Debug, Clone)]
pub struct ProcessStub {
    /// Pid reported by the process; assigned sequentially when `None`.
    pub pid: Option<u32>,
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// When true, `wait()` blocks until the container is stopped.
    pub blocks_until_stopped: bool,
}

impl Default for ProcessStub {
    fn default() -> Self {
        Self {
            pid: None,
            exit_status: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            blocks_until_stopped: false,
        }
    }
}

impl ProcessStub {
    pub fn exiting(status: i32) -> Self {
        Self {
            exit_status: status,
            ..Self::default()
        }
    }

    pub fn with_stdout(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }
}

/// A process spec as recorded by `FakeContainer::run`, along with the stdin
/// bytes that were fed to it.
#[derive(Debug, Clone)]
pub struct RanProcess {
    pub spec: ProcessSpec,
    pub stdin: Vec<u8>,
    pub pid: u32,
}

/// In-memory `Worker`.
#[derive(Default)]
pub struct FakeWorker {
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    created: Mutex<Vec<ContainerSpec>>,
    destroyed: Mutex<Vec<String>>,
    fail_create: Mutex<Option<String>>,
    pending_stubs: Mutex<HashMap<String, Vec<ProcessStub>>>,
}

impl FakeWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `create` call fail with the given message.
    pub fn fail_next_create(&self, message: &str) {
        *lock(&self.fail_create) = Some(message.to_string());
    }

    /// Pre-seeds a container, as if it survived a previous ATC process.
    pub fn add_container(&self, handle: &str) -> Arc<FakeContainer> {
        let container = Arc::new(FakeContainer::new(handle));
        lock(&self.containers).insert(handle.to_string(), container.clone());
        container
    }

    pub fn container(&self, handle: &str) -> Option<Arc<FakeContainer>> {
        lock(&self.containers).get(handle).cloned()
    }

    /// Queues process stubs for a container that does not exist yet; they
    /// are installed when a container with this handle is created.
    pub fn stub_process_for(&self, handle: &str, stub: ProcessStub) {
        lock(&self.pending_stubs)
            .entry(handle.to_string())
            .or_default()
            .push(stub);
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        lock(&self.created).clone()
    }

    pub fn destroyed_handles(&self) -> Vec<String> {
        lock(&self.destroyed).clone()
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn create(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>, WorkerError> {
        if let Some(message) = lock(&self.fail_create).take() {
            return Err(WorkerError::CreateFailed(message));
        }

        let container = Arc::new(FakeContainer::new(&spec.handle));
        if let Some(stubs) = lock(&self.pending_stubs).remove(&spec.handle) {
            for stub in stubs {
                container.stub_process(stub);
            }
        }
        lock(&self.created).push(spec.clone());
        lock(&self.containers).insert(spec.handle.clone(), container.clone());
        Ok(container)
    }

    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>, WorkerError> {
        lock(&self.containers)
            .get(handle)
            .cloned()
            .map(|c| c as Arc<dyn Container>)
            .ok_or_else(|| WorkerError::ContainerNotFound(handle.to_string()))
    }

    async fn destroy(&self, handle: &str) -> Result<(), WorkerError> {
        lock(&self.containers).remove(handle);
        lock(&self.destroyed).push(handle.to_string());
        Ok(())
    }
}

/// In-memory `Container`.
pub struct FakeContainer {
    handle: String,
    properties: Mutex<HashMap<String, String>>,
    streamed_in: Mutex<Vec<(String, Vec<u8>)>>,
    stream_out_stubs: Mutex<HashMap<String, Vec<u8>>>,
    process_stubs: Mutex<VecDeque<ProcessStub>>,
    attach_stubs: Mutex<HashMap<u32, ProcessStub>>,
    ran: Mutex<Vec<RanProcess>>,
    attached: Mutex<Vec<u32>>,
    stop_calls: Mutex<Vec<bool>>,
    stopped_tx: watch::Sender<bool>,
    next_pid: AtomicU32,
}

impl FakeContainer {
    fn new(handle: &str) -> Self {
        let (stopped_tx, _) = watch::channel(false);
        Self {
            handle: handle.to_string(),
            properties: Mutex::new(HashMap::new()),
            streamed_in: Mutex::new(Vec::new()),
            stream_out_stubs: Mutex::new(HashMap::new()),
            process_stubs: Mutex::new(VecDeque::new()),
            attach_stubs: Mutex::new(HashMap::new()),
            ran: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
            stop_calls: Mutex::new(Vec::new()),
            stopped_tx,
            next_pid: AtomicU32::new(100),
        }
    }

    /// Queues scripted behaviour for the next `run` call.
    pub fn stub_process(&self, stub: ProcessStub) {
        lock(&self.process_stubs).push_back(stub);
    }

    /// Scripts the process returned when attaching to `pid`.
    pub fn stub_attach(&self, pid: u32, stub: ProcessStub) {
        lock(&self.attach_stubs).insert(pid, stub);
    }

    /// Stubs the tar bytes returned by `stream_out` for a path.
    pub fn stub_stream_out(&self, path: &str, tar: impl Into<Vec<u8>>) {
        lock(&self.stream_out_stubs).insert(path.to_string(), tar.into());
    }

    pub fn ran_processes(&self) -> Vec<RanProcess> {
        lock(&self.ran).clone()
    }

    pub fn attached_pids(&self) -> Vec<u32> {
        lock(&self.attached).clone()
    }

    pub fn streamed_in(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.streamed_in).clone()
    }

    pub fn stop_calls(&self) -> Vec<bool> {
        lock(&self.stop_calls).clone()
    }

    pub fn property(&self, name: &str) -> Option<String> {
        lock(&self.properties).get(name).cloned()
    }

    pub fn set_property_sync(&self, name: &str, value: &str) {
        lock(&self.properties).insert(name.to_string(), value.to_string());
    }

    async fn spawn_stub(
        &self,
        stub: ProcessStub,
        pid: u32,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>, WorkerError> {
        if let Some(mut stdout) = io.stdout {
            stdout.write_all(&stub.stdout).await?;
        }
        if let Some(mut stderr) = io.stderr {
            stderr.write_all(&stub.stderr).await?;
        }

        Ok(Box::new(FakeProcess {
            pid,
            exit_status: stub.exit_status,
            blocks_until_stopped: stub.blocks_until_stopped,
            stopped_rx: self.stopped_tx.subscribe(),
            signals: Vec::new(),
        }))
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>, WorkerError> {
        let stub = lock(&self.process_stubs).pop_front().unwrap_or_default();
        let pid = stub
            .pid
            .unwrap_or_else(|| self.next_pid.fetch_add(1, Ordering::SeqCst));

        lock(&self.ran).push(RanProcess {
            spec,
            stdin: io.stdin.clone().unwrap_or_default(),
            pid,
        });

        self.spawn_stub(stub, pid, io).await
    }

    async fn attach(&self, pid: u32, io: ProcessIo) -> Result<Box<dyn Process>, WorkerError> {
        let stub = lock(&self.attach_stubs)
            .remove(&pid)
            .ok_or(WorkerError::ProcessNotFound(pid))?;

        lock(&self.attached).push(pid);
        self.spawn_stub(stub, pid, io).await
    }

    async fn stream_in(&self, dest_path: &str, tar: TarStream) -> Result<(), WorkerError> {
        let bytes = collect_stream(tar).await?;
        lock(&self.streamed_in).push((dest_path.to_string(), bytes));
        Ok(())
    }

    async fn stream_out(&self, src_path: &str) -> Result<TarStream, WorkerError> {
        let bytes = lock(&self.stream_out_stubs)
            .get(src_path)
            .cloned()
            .ok_or_else(|| {
                WorkerError::OperationFailed(format!("no stream-out stub for '{src_path}'"))
            })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<(), WorkerError> {
        lock(&self.properties).insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn get_property(&self, name: &str) -> Result<Option<String>, WorkerError> {
        Ok(lock(&self.properties).get(name).cloned())
    }

    async fn stop(&self, kill: bool) -> Result<(), WorkerError> {
        lock(&self.stop_calls).push(kill);
        let _ = self.stopped_tx.send(true);
        Ok(())
    }
}

/// In-memory `Process`.
pub struct FakeProcess {
    pid: u32,
    exit_status: i32,
    blocks_until_stopped: bool,
    stopped_rx: watch::Receiver<bool>,
    signals: Vec<ProcessSignal>,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<i32, WorkerError> {
        if self.blocks_until_stopped {
            while !*self.stopped_rx.borrow() {
                if self.stopped_rx.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(self.exit_status)
    }

    async fn signal(&mut self, signal: ProcessSignal) -> Result<(), WorkerError> {
        self.signals.push(signal);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedBuffer;

    #[tokio::test]
    async fn test_create_then_lookup_by_handle() {
        let worker = FakeWorker::new();
        worker
            .create(ContainerSpec {
                handle: "some-handle".to_string(),
                root_fs: "img1".to_string(),
                privileged: true,
                ..ContainerSpec::default()
            })
            .await
            .unwrap();

        let container = worker.lookup("some-handle").await.unwrap();
        assert_eq!(container.handle(), "some-handle");

        assert!(matches!(
            worker.lookup("bogus").await,
            Err(WorkerError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_records_spec_and_stdin_and_writes_output() {
        let worker = FakeWorker::new();
        worker
            .create(ContainerSpec {
                handle: "c".to_string(),
                ..ContainerSpec::default()
            })
            .await
            .unwrap();

        let container = worker.container("c").unwrap();
        container.stub_process(ProcessStub {
            exit_status: 3,
            stdout: b"out".to_vec(),
            ..ProcessStub::default()
        });

        let stdout = SharedBuffer::new();
        let mut process = container
            .run(
                ProcessSpec {
                    path: "/opt/resource/check".to_string(),
                    ..ProcessSpec::default()
                },
                ProcessIo {
                    stdin: Some(b"{}".to_vec()),
                    stdout: Some(stdout.sink()),
                    stderr: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(process.wait().await.unwrap(), 3);
        assert_eq!(stdout.contents_string(), "out");

        let ran = container.ran_processes();
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].spec.path, "/opt/resource/check");
        assert_eq!(ran[0].stdin, b"{}");
    }

    #[tokio::test]
    async fn test_blocking_process_released_by_stop() {
        let worker = FakeWorker::new();
        let container = worker.add_container("c");
        container.stub_process(ProcessStub {
            exit_status: 143,
            blocks_until_stopped: true,
            ..ProcessStub::default()
        });

        let looked_up = worker.lookup("c").await.unwrap();
        let mut process = looked_up
            .run(ProcessSpec::default(), ProcessIo::default())
            .await
            .unwrap();

        let stopper = looked_up.clone();
        let handle = tokio::spawn(async move {
            stopper.stop(false).await.unwrap();
        });

        assert_eq!(process.wait().await.unwrap(), 143);
        handle.await.unwrap();
        assert_eq!(container.stop_calls(), vec![false]);
    }

    #[tokio::test]
    async fn test_attach_requires_stub() {
        let worker = FakeWorker::new();
        let container = worker.add_container("c");

        container.stub_attach(42, ProcessStub::exiting(7));

        let looked_up = worker.lookup("c").await.unwrap();
        let mut process = looked_up.attach(42, ProcessIo::default()).await.unwrap();
        assert_eq!(process.id(), 42);
        assert_eq!(process.wait().await.unwrap(), 7);
        assert_eq!(container.attached_pids(), vec![42]);

        assert!(matches!(
            looked_up.attach(43, ProcessIo::default()).await,
            Err(WorkerError::ProcessNotFound(43))
        ));
    }

    #[tokio::test]
    async fn test_properties_round_trip() {
        let worker = FakeWorker::new();
        let container = worker.add_container("c");
        let looked_up = worker.lookup("c").await.unwrap();

        looked_up
            .set_property(crate::TASK_PROCESS_PROPERTY, "42")
            .await
            .unwrap();

        assert_eq!(
            looked_up
                .get_property(crate::TASK_PROCESS_PROPERTY)
                .await
                .unwrap(),
            Some("42".to_string())
        );
        assert_eq!(container.property(crate::TASK_PROCESS_PROPERTY).unwrap(), "42");
        assert_eq!(looked_up.get_property("bogus").await.unwrap(), None);
    }
}
