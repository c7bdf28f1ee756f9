//! Scriptable fake steps for composition tests.

use crate::signals::{Ready, Signals};
use crate::{
    ArtifactDestination, ArtifactSource, ExecError, ExitStatus, SourceRepository, Step,
    StepFactory, Success,
};
use async_trait::async_trait;
use atc_worker::WorkerError;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted behaviour for a fake step.
#[derive(Clone, Default)]
pub(crate) struct StepSpec {
    pub error: Option<String>,
    pub success: Option<bool>,
    pub exit: Option<i32>,
    pub block_until_signal: bool,
    pub files: HashMap<String, Vec<u8>>,
}

impl StepSpec {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn blocking() -> Self {
        Self {
            block_until_signal: true,
            ..Self::default()
        }
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }
}

/// Factory recording every binding and handing out fake steps.
pub(crate) struct FakeStepFactory {
    spec: StepSpec,
    bound: Mutex<Vec<Arc<FakeStep>>>,
    prevs: Mutex<Vec<Arc<dyn Step>>>,
}

impl FakeStepFactory {
    pub fn new(spec: StepSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            bound: Mutex::new(Vec::new()),
            prevs: Mutex::new(Vec::new()),
        })
    }

    pub fn bound_step(&self) -> Option<Arc<dyn Step>> {
        self.bound
            .lock()
            .unwrap()
            .first()
            .cloned()
            .map(|s| s as Arc<dyn Step>)
    }

    pub fn bound_prev(&self) -> Option<Arc<dyn Step>> {
        self.prevs.lock().unwrap().first().cloned()
    }

    pub fn run_count(&self) -> u32 {
        self.bound
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.runs.load(Ordering::SeqCst))
            .sum()
    }

    pub fn release_count(&self) -> u32 {
        self.bound
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.releases.load(Ordering::SeqCst))
            .sum()
    }
}

impl StepFactory for FakeStepFactory {
    fn using(&self, prev: Arc<dyn Step>, _repo: Arc<SourceRepository>) -> Arc<dyn Step> {
        let step = Arc::new(FakeStep {
            spec: self.spec.clone(),
            runs: AtomicU32::new(0),
            releases: AtomicU32::new(0),
        });
        self.bound.lock().unwrap().push(step.clone());
        self.prevs.lock().unwrap().push(prev);
        step
    }
}

pub(crate) struct FakeStep {
    spec: StepSpec,
    runs: AtomicU32,
    releases: AtomicU32,
}

impl FakeStep {
    pub fn standalone(spec: StepSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            runs: AtomicU32::new(0),
            releases: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ArtifactSource for FakeStep {
    async fn stream_to(&self, _destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        Ok(())
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        self.spec
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ExecError::FileNotFound(path.to_string()))
    }
}

#[async_trait]
impl Step for FakeStep {
    async fn run(&self, mut signals: Signals, mut ready: Ready) -> Result<(), ExecError> {
        ready.notify();
        self.runs.fetch_add(1, Ordering::SeqCst);

        if self.spec.block_until_signal {
            signals.recv().await;
            return Err(ExecError::Interrupted);
        }

        match &self.spec.error {
            Some(message) => Err(ExecError::Worker(WorkerError::OperationFailed(
                message.clone(),
            ))),
            None => Ok(()),
        }
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn result(&self, out: &mut dyn Any) -> bool {
        if let Some(success) = self.spec.success {
            if let Some(slot) = out.downcast_mut::<Success>() {
                *slot = Success(success);
                return true;
            }
        }
        if let Some(exit) = self.spec.exit {
            if let Some(slot) = out.downcast_mut::<ExitStatus>() {
                *slot = ExitStatus(exit);
                return true;
            }
        }
        false
    }
}
