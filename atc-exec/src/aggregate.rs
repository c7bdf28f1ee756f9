//! Aggregate: parallel fan-out of named steps
//!
//! Every member is bound with the same previous step and repository, so
//! children observe their shared predecessor's writes but never each
//! other's. Children run truly in parallel; the aggregate reports ready
//! once all children are, returns after all finish, and interrupts the
//! rest as soon as one errors. The first child error is the aggregate's.

use crate::signals::{Ready, Signal, Signals};
use crate::{
    presumed_success, ArtifactDestination, ArtifactSource, ExecError, ScopedDestination,
    SourceRepository, Step, StepFactory, Success,
};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Aggregate {
    members: Vec<(String, Arc<dyn StepFactory>)>,
}

impl Aggregate {
    pub fn new(members: Vec<(String, Arc<dyn StepFactory>)>) -> Arc<Self> {
        Arc::new(Self { members })
    }
}

impl StepFactory for Aggregate {
    fn using(&self, prev: Arc<dyn Step>, repo: Arc<SourceRepository>) -> Arc<dyn Step> {
        let members = self
            .members
            .iter()
            .map(|(name, factory)| (name.clone(), factory.using(prev.clone(), repo.clone())))
            .collect();

        Arc::new(AggregateStep { members })
    }
}

struct AggregateStep {
    members: Vec<(String, Arc<dyn Step>)>,
}

#[async_trait]
impl ArtifactSource for AggregateStep {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        for (name, step) in &self.members {
            step.stream_to(&ScopedDestination::new(destination, name))
                .await?;
        }
        Ok(())
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        let (member, file_path) = path
            .split_once('/')
            .ok_or_else(|| ExecError::FileNotFound(path.to_string()))?;

        for (name, step) in &self.members {
            if name == member {
                return step.stream_file(file_path).await;
            }
        }

        Err(ExecError::FileNotFound(path.to_string()))
    }
}

#[async_trait]
impl Step for AggregateStep {
    async fn run(&self, signals: Signals, mut ready: Ready) -> Result<(), ExecError> {
        if self.members.is_empty() {
            ready.notify();
            return Ok(());
        }

        let (child_handle, child_signals) = signals.derive();
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let mut waiters = Vec::with_capacity(self.members.len());
        for (name, step) in &self.members {
            let (child_ready, waiter) = Ready::new();
            waiters.push(waiter);

            let step = step.clone();
            let name = name.clone();
            let child_signals = child_signals.clone();
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let result = step.run(child_signals, child_ready).await;
                let _ = results_tx.send((name, result));
            });
        }
        drop(results_tx);

        for waiter in waiters {
            waiter.wait().await;
        }
        ready.notify();

        let mut first_error = None;
        while let Some((name, result)) = results_rx.recv().await {
            if let Err(err) = result {
                tracing::debug!(member = %name, %err, "aggregate member failed");
                if first_error.is_none() {
                    first_error = Some(err);
                    child_handle.signal(Signal::Interrupt);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn release(&self) {
        for (_, step) in &self.members {
            step.release().await;
        }
    }

    fn result(&self, out: &mut dyn Any) -> bool {
        if let Some(success) = out.downcast_mut::<Success>() {
            *success = Success(
                self.members
                    .iter()
                    .all(|(_, step)| presumed_success(&**step)),
            );
            return true;
        }
        false
    }
}
