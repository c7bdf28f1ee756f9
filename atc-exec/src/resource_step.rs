//! Get and put steps
//!
//! Both acquire a resource through the tracker under the build's session,
//! run the staged script, report the resulting version to their delegate,
//! and register themselves as the artifact source for the resource's name.
//! Their containers are ephemeral: release destroys them.

use crate::resource::{IoConfig, ResourceHandle, Session, Tracker, VersionedSource};
use crate::signals::{Ready, Signals};
use crate::{
    ArtifactDestination, ArtifactSource, ExecError, FailureReporter, FailureSink, ResourceDelegate,
    SourceRepository, Step, StepFactory, VersionInfo,
};
use async_trait::async_trait;
use atc_core::{Params, ResourceConfig, Version};
use std::any::Any;
use std::sync::{Arc, Mutex};

enum ResourceAction {
    Get { version: Option<Version> },
    Put,
}

/// Factory for a resource fetch step.
pub struct GetStepFactory {
    tracker: Arc<Tracker>,
    session: Session,
    resource: ResourceConfig,
    params: Params,
    version: Option<Version>,
    delegate: Arc<dyn ResourceDelegate>,
}

impl GetStepFactory {
    pub fn new(
        tracker: Arc<Tracker>,
        session: Session,
        resource: ResourceConfig,
        params: Params,
        version: Option<Version>,
        delegate: Arc<dyn ResourceDelegate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            session,
            resource,
            params,
            version,
            delegate,
        })
    }
}

impl StepFactory for GetStepFactory {
    fn using(&self, prev: Arc<dyn Step>, repo: Arc<SourceRepository>) -> Arc<dyn Step> {
        bind_resource_step(
            self.tracker.clone(),
            self.session.clone(),
            self.resource.clone(),
            self.params.clone(),
            ResourceAction::Get {
                version: self.version.clone(),
            },
            self.delegate.clone(),
            prev,
            repo,
        )
    }
}

/// Factory for a resource publish step.
pub struct PutStepFactory {
    tracker: Arc<Tracker>,
    session: Session,
    resource: ResourceConfig,
    params: Params,
    delegate: Arc<dyn ResourceDelegate>,
}

impl PutStepFactory {
    pub fn new(
        tracker: Arc<Tracker>,
        session: Session,
        resource: ResourceConfig,
        params: Params,
        delegate: Arc<dyn ResourceDelegate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            session,
            resource,
            params,
            delegate,
        })
    }
}

impl StepFactory for PutStepFactory {
    fn using(&self, prev: Arc<dyn Step>, repo: Arc<SourceRepository>) -> Arc<dyn Step> {
        bind_resource_step(
            self.tracker.clone(),
            self.session.clone(),
            self.resource.clone(),
            self.params.clone(),
            ResourceAction::Put,
            self.delegate.clone(),
            prev,
            repo,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn bind_resource_step(
    tracker: Arc<Tracker>,
    session: Session,
    resource: ResourceConfig,
    params: Params,
    action: ResourceAction,
    delegate: Arc<dyn ResourceDelegate>,
    prev: Arc<dyn Step>,
    repo: Arc<SourceRepository>,
) -> Arc<dyn Step> {
    let step = Arc::new(ResourceStep {
        tracker,
        session,
        resource,
        params,
        action,
        delegate: delegate.clone(),
        prev,
        repo,
        state: Mutex::new(State::default()),
    });

    FailureReporter::wrap(step, Arc::new(ResourceFailure(delegate)))
}

struct ResourceFailure(Arc<dyn ResourceDelegate>);

#[async_trait]
impl FailureSink for ResourceFailure {
    async fn failed(&self, err: &ExecError) {
        self.0.failed(err).await;
    }
}

#[derive(Default)]
struct State {
    resource: Option<Arc<ResourceHandle>>,
    versioned: Option<Arc<VersionedSource>>,
}

struct ResourceStep {
    tracker: Arc<Tracker>,
    session: Session,
    resource: ResourceConfig,
    params: Params,
    action: ResourceAction,
    delegate: Arc<dyn ResourceDelegate>,
    prev: Arc<dyn Step>,
    repo: Arc<SourceRepository>,
    state: Mutex<State>,
}

/// Projects a bound step as a plain artifact source, for staging a put's
/// input bits from the composed previous step.
struct PreviousArtifact(Arc<dyn Step>);

#[async_trait]
impl ArtifactSource for PreviousArtifact {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        self.0.stream_to(destination).await
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        self.0.stream_file(path).await
    }
}

#[async_trait]
impl ArtifactSource for ResourceStep {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        let versioned = lock(&self.state).versioned.clone();
        match versioned {
            Some(versioned) => versioned.stream_to(destination).await,
            None => Ok(()),
        }
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        let versioned = lock(&self.state).versioned.clone();
        match versioned {
            Some(versioned) => versioned.stream_file(path).await,
            None => Err(ExecError::FileNotFound(path.to_string())),
        }
    }
}

#[async_trait]
impl Step for ResourceStep {
    async fn run(&self, signals: Signals, ready: Ready) -> Result<(), ExecError> {
        let resource = Arc::new(
            self.tracker
                .init(&self.session, &self.resource.resource_type, true)
                .await?,
        );
        lock(&self.state).resource = Some(resource.clone());

        let io = IoConfig {
            stderr: Some(self.delegate.stderr()),
        };

        let versioned = Arc::new(match &self.action {
            ResourceAction::Get { version } => {
                resource.get(&self.resource.source, &self.params, version.as_ref(), io)
            }
            ResourceAction::Put => resource.put(
                &self.resource.source,
                &self.params,
                Arc::new(PreviousArtifact(self.prev.clone())),
                io,
            ),
        });
        lock(&self.state).versioned = Some(versioned.clone());

        versioned.run(signals, ready).await?;

        self.delegate
            .completed(VersionInfo {
                version: versioned.version(),
                metadata: versioned.metadata(),
            })
            .await;

        self.repo
            .register_source(self.resource.name.clone(), versioned);

        Ok(())
    }

    async fn release(&self) {
        let resource = lock(&self.state).resource.clone();
        if let Some(resource) = resource {
            resource.release().await;
        }
    }

    fn result(&self, out: &mut dyn Any) -> bool {
        let versioned = lock(&self.state).versioned.clone();
        let Some(versioned) = versioned else {
            return false;
        };

        if let Some(info) = out.downcast_mut::<VersionInfo>() {
            *info = VersionInfo {
                version: versioned.version(),
                metadata: versioned.metadata(),
            };
            return true;
        }

        false
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
