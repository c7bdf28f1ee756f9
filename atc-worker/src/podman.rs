//! Podman-backed worker
//!
//! Implements the worker contract by shelling out to the podman CLI:
//! - `create` starts a detached container sleeping indefinitely, named by
//!   the requested handle
//! - `run` is `podman exec` with stdin piped and output copied to the
//!   caller's sinks
//! - properties are files under a fixed directory inside the container, so
//!   they survive ATC restarts the same way the container does
//! - stream in/out shuttle tar archives over exec'd `tar` processes
//!
//! Re-attaching to an exec'd process is not possible through the CLI; the
//! exit-status property is the recovery path that matters after a restart.

use crate::{
    Container, ContainerSpec, Process, ProcessIo, ProcessSignal, ProcessSpec, TarStream, Worker,
    WorkerError,
};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Directory inside each container holding property files.
const PROPERTIES_DIR: &str = "/tmp/.atc-properties";

/// Checks that podman is installed and responding.
pub async fn check_podman_available() -> Result<(), WorkerError> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .map_err(|e| WorkerError::OperationFailed(format!("podman not available: {e}")))?;

    if !output.status.success() {
        return Err(WorkerError::OperationFailed(
            "podman is not working correctly".to_string(),
        ));
    }

    debug!(
        version = %String::from_utf8_lossy(&output.stdout).trim(),
        "podman is available"
    );
    Ok(())
}

/// Worker implementation over the podman CLI.
#[derive(Default)]
pub struct PodmanWorker;

impl PodmanWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

async fn podman(args: &[&str], stdin: Option<&[u8]>) -> Result<std::process::Output, WorkerError> {
    let mut command = Command::new("podman");
    command.args(args);
    command.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command.spawn()?;
    if let (Some(bytes), Some(mut handle)) = (stdin, child.stdin.take()) {
        handle.write_all(bytes).await?;
        drop(handle);
    }

    Ok(child.wait_with_output().await?)
}

fn failure(context: &str, output: &std::process::Output) -> WorkerError {
    WorkerError::OperationFailed(format!(
        "{context}: exit_code={}, stdout='{}', stderr='{}'",
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).trim(),
        String::from_utf8_lossy(&output.stderr).trim(),
    ))
}

#[async_trait]
impl Worker for PodmanWorker {
    async fn create(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>, WorkerError> {
        debug!(handle = %spec.handle, image = %spec.root_fs, "creating container");

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.handle.clone(),
            "--entrypoint".to_string(),
            "/bin/sh".to_string(),
        ];
        if spec.privileged {
            args.push("--privileged".to_string());
        }
        for pair in &spec.env {
            args.push("--env".to_string());
            args.push(pair.clone());
        }
        args.push(spec.root_fs.clone());
        args.push("-c".to_string());
        args.push("sleep infinity".to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = podman(&arg_refs, None).await?;
        if !output.status.success() {
            return Err(WorkerError::CreateFailed(format!(
                "image {}: exit_code={}, stderr='{}'",
                spec.root_fs,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }

        let container = Arc::new(PodmanContainer {
            handle: spec.handle.clone(),
        });

        let mkdir = podman(
            &["exec", &spec.handle, "mkdir", "-p", PROPERTIES_DIR],
            None,
        )
        .await?;
        if !mkdir.status.success() {
            return Err(failure("failed to prepare properties dir", &mkdir));
        }

        Ok(container)
    }

    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>, WorkerError> {
        let output = podman(&["container", "exists", handle], None).await?;
        if !output.status.success() {
            return Err(WorkerError::ContainerNotFound(handle.to_string()));
        }

        Ok(Arc::new(PodmanContainer {
            handle: handle.to_string(),
        }))
    }

    async fn destroy(&self, handle: &str) -> Result<(), WorkerError> {
        let output = podman(&["rm", "-f", handle], None).await?;
        if !output.status.success() {
            warn!(
                handle,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "failed to remove container"
            );
        }
        Ok(())
    }
}

/// A container addressed by its podman name.
pub struct PodmanContainer {
    handle: String,
}

#[async_trait]
impl Container for PodmanContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>, WorkerError> {
        let mut command = Command::new("podman");
        command.arg("exec").arg("-i");
        if spec.tty {
            command.arg("-t");
        }
        if !spec.dir.is_empty() {
            command.arg("-w").arg(&spec.dir);
        }
        for pair in &spec.env {
            command.arg("--env").arg(pair);
        }
        command.arg(&self.handle).arg(&spec.path).args(&spec.args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        debug!(handle = %self.handle, path = %spec.path, "executing in container");

        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or_default();

        if let Some(mut handle) = child.stdin.take() {
            let bytes = io.stdin.unwrap_or_default();
            handle.write_all(&bytes).await?;
            drop(handle);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let copier = tokio::spawn(async move {
            if let (Some(mut from), Some(mut to)) = (stdout, io.stdout) {
                let _ = tokio::io::copy(&mut from, &mut to).await;
            }
            if let (Some(mut from), Some(mut to)) = (stderr, io.stderr) {
                let _ = tokio::io::copy(&mut from, &mut to).await;
            }
        });

        Ok(Box::new(PodmanProcess { pid, child, copier }))
    }

    async fn attach(&self, pid: u32, _io: ProcessIo) -> Result<Box<dyn Process>, WorkerError> {
        // podman exec sessions cannot be rejoined from a new process
        Err(WorkerError::ProcessNotFound(pid))
    }

    async fn stream_in(&self, dest_path: &str, tar: TarStream) -> Result<(), WorkerError> {
        let bytes = crate::collect_stream(tar).await?;
        let script = format!("mkdir -p '{dest_path}' && tar -x -C '{dest_path}'");
        let output = podman(
            &["exec", "-i", &self.handle, "/bin/sh", "-c", &script],
            Some(&bytes),
        )
        .await?;

        if !output.status.success() {
            return Err(failure("failed to stream into container", &output));
        }
        Ok(())
    }

    async fn stream_out(&self, src_path: &str) -> Result<TarStream, WorkerError> {
        // tar the directory's contents, or the single file, at src_path
        let script = format!(
            "if [ -d '{src_path}' ]; then tar -c -C '{src_path}' .; \
             else cd \"$(dirname '{src_path}')\" && tar -c \"$(basename '{src_path}')\"; fi"
        );
        let output = podman(&["exec", &self.handle, "/bin/sh", "-c", &script], None).await?;

        if !output.status.success() {
            return Err(failure("failed to stream out of container", &output));
        }
        Ok(Box::new(std::io::Cursor::new(output.stdout)))
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<(), WorkerError> {
        let script = format!("cat > '{PROPERTIES_DIR}/{name}'");
        let output = podman(
            &["exec", "-i", &self.handle, "/bin/sh", "-c", &script],
            Some(value.as_bytes()),
        )
        .await?;

        if !output.status.success() {
            return Err(failure("failed to set property", &output));
        }
        Ok(())
    }

    async fn get_property(&self, name: &str) -> Result<Option<String>, WorkerError> {
        let path = format!("{PROPERTIES_DIR}/{name}");
        let output = podman(&["exec", &self.handle, "cat", &path], None).await?;

        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    async fn stop(&self, kill: bool) -> Result<(), WorkerError> {
        let output = if kill {
            podman(&["kill", &self.handle], None).await?
        } else {
            podman(&["stop", &self.handle], None).await?
        };

        if !output.status.success() {
            return Err(failure("failed to stop container", &output));
        }
        Ok(())
    }
}

/// A process exec'd through the podman CLI.
pub struct PodmanProcess {
    pid: u32,
    child: Child,
    copier: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl Process for PodmanProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<i32, WorkerError> {
        let status = self.child.wait().await?;
        let _ = (&mut self.copier).await;
        Ok(status.code().unwrap_or(-1))
    }

    async fn signal(&mut self, signal: ProcessSignal) -> Result<(), WorkerError> {
        match signal {
            ProcessSignal::Interrupt => {
                let pid = self.pid.to_string();
                let output = Command::new("kill").arg("-INT").arg(&pid).output().await?;
                if !output.status.success() {
                    warn!(pid = %pid, "failed to interrupt exec process");
                }
            }
            ProcessSignal::Terminate => {
                self.child.start_kill()?;
            }
        }
        Ok(())
    }
}
