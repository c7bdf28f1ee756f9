//! Compose: sequential composition of two steps
//!
//! Runs the first step; on success, binds and runs the second with the
//! first as its previous step. Failure or cancellation of the first
//! short-circuits the second. The composed step's result and artifacts
//! project the second step, or the first if the second never ran.

use crate::signals::{Ready, Signals};
use crate::{
    ArtifactDestination, ArtifactSource, ExecError, NoopStepFactory, SourceRepository, Step,
    StepFactory,
};
use async_trait::async_trait;
use std::any::Any;
use std::sync::{Arc, Mutex};

pub struct Compose {
    a: Arc<dyn StepFactory>,
    b: Arc<dyn StepFactory>,
}

impl Compose {
    pub fn new(a: Arc<dyn StepFactory>, b: Arc<dyn StepFactory>) -> Arc<Self> {
        Arc::new(Self { a, b })
    }

    /// Folds a sequence of factories into nested composes. An empty
    /// sequence composes to a noop.
    pub fn chain(factories: Vec<Arc<dyn StepFactory>>) -> Arc<dyn StepFactory> {
        let mut iter = factories.into_iter();
        let Some(first) = iter.next() else {
            return Arc::new(NoopStepFactory);
        };

        iter.fold(first, |a, b| Compose::new(a, b) as Arc<dyn StepFactory>)
    }
}

impl StepFactory for Compose {
    fn using(&self, prev: Arc<dyn Step>, repo: Arc<SourceRepository>) -> Arc<dyn Step> {
        Arc::new(ComposeStep {
            a: self.a.clone(),
            b: self.b.clone(),
            prev,
            repo,
            state: Mutex::new(State::default()),
        })
    }
}

#[derive(Default)]
struct State {
    first: Option<Arc<dyn Step>>,
    second: Option<Arc<dyn Step>>,
}

struct ComposeStep {
    a: Arc<dyn StepFactory>,
    b: Arc<dyn StepFactory>,
    prev: Arc<dyn Step>,
    repo: Arc<SourceRepository>,
    state: Mutex<State>,
}

impl ComposeStep {
    /// The step results and artifacts project onto.
    fn current(&self) -> Option<Arc<dyn Step>> {
        let state = lock(&self.state);
        state.second.clone().or_else(|| state.first.clone())
    }
}

#[async_trait]
impl ArtifactSource for ComposeStep {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        match self.current() {
            Some(step) => step.stream_to(destination).await,
            None => Ok(()),
        }
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        match self.current() {
            Some(step) => step.stream_file(path).await,
            None => Err(ExecError::FileNotFound(path.to_string())),
        }
    }
}

#[async_trait]
impl Step for ComposeStep {
    async fn run(&self, signals: Signals, ready: Ready) -> Result<(), ExecError> {
        let first = self.a.using(self.prev.clone(), self.repo.clone());
        lock(&self.state).first = Some(first.clone());

        first.run(signals.clone(), ready).await?;

        // a signal that arrived while the first step was finishing still
        // short-circuits the second
        if signals.pending().is_some() {
            return Err(ExecError::Interrupted);
        }

        let second = self.b.using(first, self.repo.clone());
        lock(&self.state).second = Some(second.clone());

        second.run(signals, Ready::detached()).await
    }

    async fn release(&self) {
        let (first, second) = {
            let state = lock(&self.state);
            (state.first.clone(), state.second.clone())
        };

        if let Some(step) = first {
            step.release().await;
        }
        if let Some(step) = second {
            step.release().await;
        }
    }

    fn result(&self, out: &mut dyn Any) -> bool {
        match self.current() {
            Some(step) => step.result(out),
            None => false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
