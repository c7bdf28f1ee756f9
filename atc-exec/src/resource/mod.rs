//! Resource tracking and script execution
//!
//! Steps acquire live resource handles through the `Tracker`: a container
//! per (session, resource type), created privileged from the type's image,
//! or re-attached by session handle when one already exists. A handle runs
//! the type's `/opt/resource/{check,in,out}` scripts with the JSON protocol
//! on stdin/stdout.

mod versioned_source;

pub(crate) use versioned_source::read_single_file;
pub use versioned_source::{IoConfig, VersionedSource};

use crate::signals::signal_channel;
use atc_core::{Params, Source, Version};
use atc_worker::{Container, ContainerSpec, TarStream, Worker, WorkerError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Directory resource bits live under inside a container.
pub const RESOURCES_DIR: &str = "/tmp/build/src";

/// Mapping of resource type name to container image.
pub type ResourceMapping = BTreeMap<String, String>;

/// Resource acquisition and script errors.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("failed to create container: {0}")]
    ContainerCreateFailed(#[source] WorkerError),

    #[error(
        "resource script '{path}' failed: exit status {exit_status}\n\nstdout:\n{stdout}\n\nstderr:\n{stderr}"
    )]
    ScriptFailed {
        path: String,
        exit_status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("malformed script response: {0}")]
    MalformedResponse(#[source] serde_json::Error),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl ResourceError {
    pub fn kind(&self) -> crate::ErrorKind {
        match self {
            ResourceError::UnknownResourceType(_) => crate::ErrorKind::Config,
            ResourceError::ScriptFailed { .. } | ResourceError::MalformedResponse(_) => {
                crate::ErrorKind::Script
            }
            ResourceError::Interrupted => crate::ErrorKind::Interrupted,
            ResourceError::ContainerCreateFailed(_) | ResourceError::Worker(_) => {
                crate::ErrorKind::Infrastructure
            }
        }
    }
}

/// What a container is for. Together with a name this uniquely identifies
/// the container across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScope {
    Build(i64),
    ResourceCheck,
}

/// The stable key under which a container can be re-discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub scope: SessionScope,
    pub name: String,
}

impl Session {
    pub fn for_build(build_id: i64, name: impl Into<String>) -> Self {
        Self {
            scope: SessionScope::Build(build_id),
            name: name.into(),
        }
    }

    pub fn for_resource_check(resource: impl Into<String>) -> Self {
        Self {
            scope: SessionScope::ResourceCheck,
            name: resource.into(),
        }
    }

    /// Deterministic container handle, so lookup by session is a stable
    /// string operation.
    pub fn handle(&self) -> String {
        match self.scope {
            SessionScope::Build(id) => format!("atc-build-{}-{}", id, sanitize(&self.name)),
            SessionScope::ResourceCheck => format!("atc-check-{}", sanitize(&self.name)),
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// The registry through which steps acquire resource handles.
pub struct Tracker {
    resource_types: ResourceMapping,
    worker: Arc<dyn Worker>,
}

impl Tracker {
    pub fn new(resource_types: ResourceMapping, worker: Arc<dyn Worker>) -> Arc<Self> {
        Arc::new(Self {
            resource_types,
            worker,
        })
    }

    /// Returns a live resource handle for the session, backed by a newly
    /// created privileged container, or by the existing one when the
    /// session already has a container (attach-on-restart).
    ///
    /// Ephemeral handles destroy their container on release; non-ephemeral
    /// ones leave it for the next lookup.
    pub async fn init(
        &self,
        session: &Session,
        resource_type: &str,
        ephemeral: bool,
    ) -> Result<ResourceHandle, ResourceError> {
        let image = self
            .resource_types
            .get(resource_type)
            .ok_or_else(|| ResourceError::UnknownResourceType(resource_type.to_string()))?;

        let handle = session.handle();
        let container = match self.worker.lookup(&handle).await {
            Ok(container) => {
                debug!(handle, "reusing existing resource container");
                container
            }
            Err(WorkerError::ContainerNotFound(_)) => self
                .worker
                .create(ContainerSpec {
                    handle: handle.clone(),
                    root_fs: image.clone(),
                    privileged: true,
                    ..ContainerSpec::default()
                })
                .await
                .map_err(ResourceError::ContainerCreateFailed)?,
            Err(err) => return Err(err.into()),
        };

        Ok(ResourceHandle {
            worker: self.worker.clone(),
            container,
            ephemeral,
            released: AtomicBool::new(false),
        })
    }
}

#[derive(Serialize)]
struct CheckRequest<'a> {
    source: &'a Source,
    version: Option<&'a Version>,
}

#[derive(Serialize)]
struct InRequest<'a> {
    source: &'a Source,
    version: Option<&'a Version>,
    #[serde(skip_serializing_if = "Params::is_empty")]
    params: &'a Params,
}

#[derive(Serialize)]
struct OutRequest<'a> {
    source: &'a Source,
    #[serde(skip_serializing_if = "Params::is_empty")]
    params: &'a Params,
}

/// A live resource: one container, addressed by its session.
pub struct ResourceHandle {
    worker: Arc<dyn Worker>,
    container: Arc<dyn Container>,
    ephemeral: bool,
    released: AtomicBool,
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("ephemeral", &self.ephemeral)
            .field("released", &self.released)
            .finish()
    }
}

impl ResourceHandle {
    pub fn container(&self) -> Arc<dyn Container> {
        self.container.clone()
    }

    /// Stages the container to run `/opt/resource/in` for the given version.
    pub fn get(
        &self,
        source: &Source,
        params: &Params,
        version: Option<&Version>,
        io: IoConfig,
    ) -> VersionedSource {
        let request = serde_json::to_value(InRequest {
            source,
            version,
            params,
        })
        .unwrap_or_default();

        VersionedSource::new(
            self.container.clone(),
            "/opt/resource/in",
            vec![RESOURCES_DIR.to_string()],
            request,
            None,
            io,
        )
    }

    /// Stages the container to run `/opt/resource/out`, streaming the
    /// artifact source into the container first.
    pub fn put(
        &self,
        source: &Source,
        params: &Params,
        artifact: Arc<dyn crate::ArtifactSource>,
        io: IoConfig,
    ) -> VersionedSource {
        let request = serde_json::to_value(OutRequest { source, params }).unwrap_or_default();

        VersionedSource::new(
            self.container.clone(),
            "/opt/resource/out",
            vec![RESOURCES_DIR.to_string()],
            request,
            Some(artifact),
            io,
        )
    }

    /// Runs `/opt/resource/check` to completion and returns the versions
    /// newer than `from`, oldest first, exactly as the script emitted them.
    pub async fn check(
        &self,
        source: &Source,
        from: Option<&Version>,
    ) -> Result<Vec<Version>, ResourceError> {
        let request = serde_json::to_value(CheckRequest {
            source,
            version: from,
        })
        .unwrap_or_default();

        // check is not signallable; give it a channel nobody fires
        let (_handle, signals) = signal_channel();
        let stdout = versioned_source::run_script(
            &self.container,
            "/opt/resource/check",
            &[],
            &request,
            signals,
            crate::signals::Ready::detached(),
            None,
        )
        .await?;

        serde_json::from_slice(&stdout).map_err(ResourceError::MalformedResponse)
    }

    /// Releases the handle. Ephemeral handles destroy their container;
    /// non-ephemeral ones leave it for re-attachment. Idempotent.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.ephemeral {
            if let Err(err) = self.worker.destroy(self.container.handle()).await {
                warn!(handle = %self.container.handle(), %err, "failed to destroy resource container");
            }
        }
    }

    /// Force-destroys the container, bypassing the keep-alive policy.
    pub async fn destroy(&self) {
        self.released.store(true, Ordering::SeqCst);
        if let Err(err) = self.worker.destroy(self.container.handle()).await {
            warn!(handle = %self.container.handle(), %err, "failed to destroy resource container");
        }
    }
}

/// An artifact destination rooted at a path inside a container.
pub struct ContainerDestination {
    container: Arc<dyn Container>,
    root: String,
}

impl ContainerDestination {
    pub fn new(container: Arc<dyn Container>, root: impl Into<String>) -> Self {
        Self {
            container,
            root: root.into(),
        }
    }
}

#[async_trait::async_trait]
impl crate::ArtifactDestination for ContainerDestination {
    async fn stream_in(&self, dest_path: &str, tar: TarStream) -> Result<(), crate::ExecError> {
        let path = join_path(&self.root, dest_path);
        self.container
            .stream_in(&path, tar)
            .await
            .map_err(crate::ExecError::Worker)
    }
}

pub(crate) fn join_path(root: &str, rel: &str) -> String {
    if rel.is_empty() || rel == "." {
        root.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atc_worker::fakes::{FakeWorker, ProcessStub};

    fn mapping() -> ResourceMapping {
        ResourceMapping::from([
            ("type1".to_string(), "image1".to_string()),
            ("type2".to_string(), "image2".to_string()),
        ])
    }

    #[test]
    fn test_session_handles_are_deterministic() {
        let get = Session::for_build(42, "get:foo");
        assert_eq!(get.handle(), "atc-build-42-get-foo");
        assert_eq!(get.handle(), Session::for_build(42, "get:foo").handle());

        let check = Session::for_resource_check("foo");
        assert_eq!(check.handle(), "atc-check-foo");
    }

    #[tokio::test]
    async fn test_init_creates_privileged_container_with_type_image() {
        let worker = FakeWorker::new();
        let tracker = Tracker::new(mapping(), worker.clone());

        tracker
            .init(&Session::for_resource_check("foo"), "type1", false)
            .await
            .unwrap();

        let specs = worker.created_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].handle, "atc-check-foo");
        assert_eq!(specs[0].root_fs, "image1");
        assert!(specs[0].privileged);
    }

    #[tokio::test]
    async fn test_init_unknown_type() {
        let worker = FakeWorker::new();
        let tracker = Tracker::new(mapping(), worker);

        let err = tracker
            .init(&Session::for_resource_check("foo"), "bogus-type", false)
            .await
            .unwrap_err();

        assert!(matches!(err, ResourceError::UnknownResourceType(t) if t == "bogus-type"));
    }

    #[tokio::test]
    async fn test_init_reuses_existing_session_container() {
        let worker = FakeWorker::new();
        worker.add_container("atc-check-foo");
        let tracker = Tracker::new(mapping(), worker.clone());

        tracker
            .init(&Session::for_resource_check("foo"), "type1", false)
            .await
            .unwrap();

        assert!(worker.created_specs().is_empty());
    }

    #[tokio::test]
    async fn test_init_create_failure() {
        let worker = FakeWorker::new();
        worker.fail_next_create("oh no");
        let tracker = Tracker::new(mapping(), worker);

        let err = tracker
            .init(&Session::for_resource_check("foo"), "type1", false)
            .await
            .unwrap_err();

        assert!(matches!(err, ResourceError::ContainerCreateFailed(_)));
    }

    #[tokio::test]
    async fn test_check_runs_script_with_request_on_stdin() {
        let worker = FakeWorker::new();
        let tracker = Tracker::new(mapping(), worker.clone());
        let resource = tracker
            .init(&Session::for_resource_check("foo"), "type1", false)
            .await
            .unwrap();

        let container = worker.container("atc-check-foo").unwrap();
        container.stub_process(ProcessStub::with_stdout(
            r#"[{"ver":"abc"}, {"ver":"def"}, {"ver":"ghi"}]"#,
        ));

        let source = Source::from([("uri".to_string(), "http://example.com".to_string())]);
        let from = Version::from([("ver".to_string(), "abc".to_string())]);
        let versions = resource.check(&source, Some(&from)).await.unwrap();

        assert_eq!(versions.len(), 3);
        assert_eq!(versions[0].get("ver").unwrap(), "abc");
        assert_eq!(versions[2].get("ver").unwrap(), "ghi");

        let ran = container.ran_processes();
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].spec.path, "/opt/resource/check");
        assert!(ran[0].spec.privileged);

        let request: serde_json::Value = serde_json::from_slice(&ran[0].stdin).unwrap();
        assert_eq!(request["source"]["uri"], "http://example.com");
        assert_eq!(request["version"]["ver"], "abc");
    }

    #[tokio::test]
    async fn test_check_nonzero_exit_includes_output_verbatim() {
        let worker = FakeWorker::new();
        let tracker = Tracker::new(mapping(), worker.clone());
        let resource = tracker
            .init(&Session::for_resource_check("foo"), "type1", false)
            .await
            .unwrap();

        worker.container("atc-check-foo").unwrap().stub_process(ProcessStub {
            exit_status: 9,
            stdout: b"some-stdout-data".to_vec(),
            stderr: b"some-stderr-data".to_vec(),
            ..ProcessStub::default()
        });

        let err = resource.check(&Source::new(), None).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit status 9"));
        assert!(message.contains("some-stdout-data"));
        assert!(message.contains("some-stderr-data"));
    }

    #[tokio::test]
    async fn test_release_destroys_only_ephemeral_containers() {
        let worker = FakeWorker::new();
        let tracker = Tracker::new(mapping(), worker.clone());

        let ephemeral = tracker
            .init(&Session::for_build(1, "get:foo"), "type1", true)
            .await
            .unwrap();
        ephemeral.release().await;
        ephemeral.release().await;
        assert_eq!(worker.destroyed_handles(), vec!["atc-build-1-get-foo"]);

        let durable = tracker
            .init(&Session::for_resource_check("foo"), "type1", false)
            .await
            .unwrap();
        durable.release().await;
        assert_eq!(worker.destroyed_handles().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_bypasses_keep_alive() {
        let worker = FakeWorker::new();
        let tracker = Tracker::new(mapping(), worker.clone());

        let durable = tracker
            .init(&Session::for_resource_check("foo"), "type1", false)
            .await
            .unwrap();
        durable.destroy().await;

        assert_eq!(worker.destroyed_handles(), vec!["atc-check-foo"]);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/tmp/build/src", "."), "/tmp/build/src");
        assert_eq!(join_path("/tmp/build/src", ""), "/tmp/build/src");
        assert_eq!(join_path("/tmp/build/src", "sub"), "/tmp/build/src/sub");
        assert_eq!(join_path("/tmp/build/src/", "sub"), "/tmp/build/src/sub");
    }
}
