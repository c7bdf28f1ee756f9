//! ATC Worker
//!
//! The container-provider contract consumed by the step engine and the
//! resource tracker:
//! - `Worker`: creates, looks up and destroys containers by handle
//! - `Container`: runs and re-attaches processes, streams tar archives in
//!   and out, and carries persistent string properties
//! - `Process`: a running (or re-attached) process that can be waited on
//!   and signalled
//!
//! Two implementations ship with the crate: `podman` shells out to the
//! podman CLI, and `fakes` provides scriptable in-memory doubles for tests.

pub mod fakes;
pub mod podman;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Container property recording the pid of a task's process, as a decimal
/// string. Written immediately after the process starts so a restarted ATC
/// can re-attach.
pub const TASK_PROCESS_PROPERTY: &str = "concourse:task-process";

/// Container property recording a finished task's exit code, as a decimal
/// string. Its presence means the task does not need to run again.
pub const EXIT_STATUS_PROPERTY: &str = "concourse:exit-status";

/// A tar archive flowing into or out of a container.
pub type TarStream = Box<dyn AsyncRead + Send + Unpin>;

/// Destination for a process output stream.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Worker operation errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("container '{0}' not found")]
    ContainerNotFound(String),

    #[error("failed to create container: {0}")]
    CreateFailed(String),

    #[error("process {0} not found in container")]
    ProcessNotFound(u32),

    #[error("container operation failed: {0}")]
    OperationFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Spec for a new container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Stable handle; lookup by this handle must work across restarts.
    pub handle: String,
    /// Image providing the container's root filesystem.
    pub root_fs: String,
    pub tags: Vec<String>,
    pub privileged: bool,
    /// `KEY=value` pairs applied to every process in the container.
    pub env: Vec<String>,
}

/// Spec for a process inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    /// Working directory; empty means the container default.
    pub dir: String,
    pub privileged: bool,
    pub tty: bool,
}

/// IO wiring for a process: a fixed stdin payload and optional output sinks.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Vec<u8>>,
    pub stdout: Option<OutputSink>,
    pub stderr: Option<OutputSink>,
}

/// Signals deliverable to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
}

/// The container provider.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Creates a container for the given spec. The spec's handle becomes
    /// the container's stable lookup key.
    async fn create(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>, WorkerError>;

    /// Finds an existing container by handle.
    ///
    /// Returns `WorkerError::ContainerNotFound` when no container exists.
    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>, WorkerError>;

    /// Force-destroys a container by handle. Destroying a missing container
    /// is not an error.
    async fn destroy(&self, handle: &str) -> Result<(), WorkerError>;
}

/// A live container.
#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> &str;

    /// Starts a process in the container.
    async fn run(&self, spec: ProcessSpec, io: ProcessIo)
        -> Result<Box<dyn Process>, WorkerError>;

    /// Re-attaches to a previously started process by pid.
    async fn attach(&self, pid: u32, io: ProcessIo) -> Result<Box<dyn Process>, WorkerError>;

    /// Extracts a tar stream under the given container path, creating it if
    /// necessary.
    async fn stream_in(&self, dest_path: &str, tar: TarStream) -> Result<(), WorkerError>;

    /// Returns a tar stream rooted at the given container path. The caller
    /// owns (and must drain or drop) the stream.
    async fn stream_out(&self, src_path: &str) -> Result<TarStream, WorkerError>;

    /// Sets a persistent property on the container.
    async fn set_property(&self, name: &str, value: &str) -> Result<(), WorkerError>;

    /// Reads a property previously set on the container.
    async fn get_property(&self, name: &str) -> Result<Option<String>, WorkerError>;

    /// Stops every process in the container. `kill: false` allows a graceful
    /// shutdown window before the hard kill; `kill: true` kills immediately.
    async fn stop(&self, kill: bool) -> Result<(), WorkerError>;
}

/// A process started in (or re-attached to) a container.
#[async_trait]
pub trait Process: Send {
    fn id(&self) -> u32;

    /// Waits for the process to exit and returns its exit code.
    async fn wait(&mut self) -> Result<i32, WorkerError>;

    /// Delivers a signal to the process.
    async fn signal(&mut self, signal: ProcessSignal) -> Result<(), WorkerError>;
}

/// An `AsyncWrite` sink into a shared byte buffer.
///
/// Used wherever a process's output needs to be captured for later
/// inspection: resource script errors quote stdout/stderr verbatim, and
/// the fakes record everything written to them.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contents_string(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    /// Boxes a clone of this buffer as a process output sink.
    pub fn sink(&self) -> OutputSink {
        Box::new(self.clone())
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
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

/// Drains a tar stream into memory.
pub async fn collect_stream(mut stream: TarStream) -> Result<Vec<u8>, WorkerError> {
    use tokio::io::AsyncReadExt;

    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_shared_buffer_captures_writes() {
        let buffer = SharedBuffer::new();
        let mut sink = buffer.sink();

        sink.write_all(b"hello ").await.unwrap();
        sink.write_all(b"world").await.unwrap();

        assert_eq!(buffer.contents_string(), "hello world");
    }

    #[tokio::test]
    async fn test_collect_stream() {
        let stream: TarStream = Box::new(std::io::Cursor::new(b"some bytes".to_vec()));
        assert_eq!(collect_stream(stream).await.unwrap(), b"some bytes");
    }
}
