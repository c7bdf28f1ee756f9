//! Versioned sources
//!
//! A versioned source is the suspendable runnable a resource handle stages
//! for `in`/`out`: running it executes the script, after which the declared
//! version and metadata are available, and its bits can be streamed back
//! out of the container as tar archives.

use super::{join_path, ContainerDestination, ResourceError, RESOURCES_DIR};
use crate::signals::{Ready, Signal, Signals};
use crate::{ArtifactDestination, ArtifactSource, ExecError};
use async_trait::async_trait;
use atc_core::{MetadataField, Version};
use atc_worker::{
    Container, OutputSink, ProcessIo, ProcessSignal, ProcessSpec, SharedBuffer, TarStream,
};
use serde::Deserialize;
use std::io::Read;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

/// IO wiring for a resource script: where its stderr (the user-visible
/// side) goes. Script stdout carries the protocol response and is never
/// user-facing.
#[derive(Default)]
pub struct IoConfig {
    pub stderr: Option<OutputSink>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct VersionResult {
    #[serde(default)]
    version: Version,
    #[serde(default)]
    metadata: Vec<MetadataField>,
}

/// A staged `in`/`out` script run.
pub struct VersionedSource {
    container: Arc<dyn Container>,
    script_path: &'static str,
    script_args: Vec<String>,
    request: serde_json::Value,
    staging: Mutex<Option<Arc<dyn ArtifactSource>>>,
    io: Mutex<Option<OutputSink>>,
    result: Mutex<Option<VersionResult>>,
}

impl VersionedSource {
    pub(super) fn new(
        container: Arc<dyn Container>,
        script_path: &'static str,
        script_args: Vec<String>,
        request: serde_json::Value,
        staging: Option<Arc<dyn ArtifactSource>>,
        io: IoConfig,
    ) -> Self {
        Self {
            container,
            script_path,
            script_args,
            request,
            staging: Mutex::new(staging),
            io: Mutex::new(io.stderr),
            result: Mutex::new(None),
        }
    }

    /// Runs the script to completion. For `out`, the staged artifact source
    /// is streamed into the container first.
    pub async fn run(&self, signals: Signals, ready: Ready) -> Result<(), ExecError> {
        let staging = lock(&self.staging).take();
        if let Some(artifact) = staging {
            let destination = ContainerDestination::new(self.container.clone(), RESOURCES_DIR);
            artifact.stream_to(&destination).await?;
        }

        let stderr = lock(&self.io).take();
        let stdout = run_script(
            &self.container,
            self.script_path,
            &self.script_args,
            &self.request,
            signals,
            ready,
            stderr,
        )
        .await?;

        let result: VersionResult =
            serde_json::from_slice(&stdout).map_err(ResourceError::MalformedResponse)?;
        *lock(&self.result) = Some(result);

        Ok(())
    }

    /// The version the script declared. Meaningful after completion.
    pub fn version(&self) -> Version {
        lock(&self.result)
            .as_ref()
            .map(|r| r.version.clone())
            .unwrap_or_default()
    }

    /// The script's metadata block. Meaningful after completion.
    pub fn metadata(&self) -> Vec<MetadataField> {
        lock(&self.result)
            .as_ref()
            .map(|r| r.metadata.clone())
            .unwrap_or_default()
    }

    /// A tar stream rooted at the given path under the resource directory.
    pub async fn stream_out(&self, path: &str) -> Result<TarStream, ExecError> {
        self.container
            .stream_out(&join_path(RESOURCES_DIR, path))
            .await
            .map_err(ExecError::Worker)
    }
}

#[async_trait]
impl ArtifactSource for VersionedSource {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        let stream = self.stream_out(".").await?;
        destination.stream_in(".", stream).await
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        let stream = self.stream_out(path).await?;
        let bytes = atc_worker::collect_stream(stream).await.map_err(ExecError::Worker)?;
        read_single_file(&bytes, path)
    }
}

/// Extracts the first regular file from a tar archive.
pub(crate) fn read_single_file(tar_bytes: &[u8], path: &str) -> Result<Vec<u8>, ExecError> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(tar_bytes));
    let entries = archive
        .entries()
        .map_err(|_| ExecError::FileNotFound(path.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|_| ExecError::FileNotFound(path.to_string()))?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|_| ExecError::FileNotFound(path.to_string()))?;
            return Ok(contents);
        }
    }

    Err(ExecError::FileNotFound(path.to_string()))
}

/// Runs a resource script with the request JSON on stdin, notifying `ready`
/// once the process is started. Returns the raw stdout on exit 0.
///
/// A signal interrupts the script: it is forwarded to the process, the
/// container is stopped without killing, the process is reaped, and
/// `Interrupted` bubbles up.
pub(crate) async fn run_script(
    container: &Arc<dyn Container>,
    path: &str,
    args: &[String],
    request: &serde_json::Value,
    mut signals: Signals,
    mut ready: Ready,
    user_stderr: Option<OutputSink>,
) -> Result<Vec<u8>, ResourceError> {
    let stdout = SharedBuffer::new();
    let stderr = SharedBuffer::new();

    let request_bytes = serde_json::to_vec(request).map_err(ResourceError::MalformedResponse)?;

    let mut process = container
        .run(
            ProcessSpec {
                path: path.to_string(),
                args: args.to_vec(),
                privileged: true,
                ..ProcessSpec::default()
            },
            ProcessIo {
                stdin: Some(request_bytes),
                stdout: Some(stdout.sink()),
                stderr: Some(stderr.sink()),
            },
        )
        .await?;

    ready.notify();

    enum Outcome {
        Exited(Result<i32, atc_worker::WorkerError>),
        Signalled(Signal),
    }

    let outcome = tokio::select! {
        status = process.wait() => Outcome::Exited(status),
        signal = signals.recv() => Outcome::Signalled(signal),
    };

    let status = match outcome {
        Outcome::Exited(status) => status?,
        Outcome::Signalled(signal) => {
            let process_signal = match signal {
                Signal::Interrupt => ProcessSignal::Interrupt,
                Signal::Terminate => ProcessSignal::Terminate,
            };
            let _ = process.signal(process_signal).await;
            let _ = container.stop(false).await;
            let _ = process.wait().await;
            return Err(ResourceError::Interrupted);
        }
    };

    if let Some(mut sink) = user_stderr {
        let _ = sink.write_all(&stderr.contents()).await;
    }

    if status != 0 {
        return Err(ResourceError::ScriptFailed {
            path: path.to_string(),
            exit_status: status,
            stdout: stdout.contents_string(),
            stderr: stderr.contents_string(),
        });
    }

    Ok(stdout.contents())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
