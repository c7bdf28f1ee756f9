//! Conditional: gating a step on the previous step's outcome
//!
//! After binding, inspects the previous step's `Success` result; a step
//! with no opinion is presumed successful, since it ran at all. When the
//! condition set matches, the wrapped factory is bound and run; otherwise
//! the conditional degenerates to a noop. Hooks (`on_success`,
//! `on_failure`, `ensure`) are conditionals over the job body with the
//! corresponding condition sets.

use crate::signals::{Ready, Signals};
use crate::{
    presumed_success, ArtifactDestination, ArtifactSource, ExecError, NoopStep, SourceRepository,
    Step, StepFactory,
};
use async_trait::async_trait;
use atc_core::Conditions;
use std::any::Any;
use std::sync::{Arc, Mutex};

pub struct Conditional {
    conditions: Conditions,
    factory: Arc<dyn StepFactory>,
}

impl Conditional {
    pub fn new(conditions: Conditions, factory: Arc<dyn StepFactory>) -> Arc<Self> {
        Arc::new(Self {
            conditions,
            factory,
        })
    }
}

impl StepFactory for Conditional {
    fn using(&self, prev: Arc<dyn Step>, repo: Arc<SourceRepository>) -> Arc<dyn Step> {
        Arc::new(ConditionalStep {
            conditions: self.conditions.clone(),
            factory: self.factory.clone(),
            prev,
            repo,
            chosen: Mutex::new(None),
        })
    }
}

struct ConditionalStep {
    conditions: Conditions,
    factory: Arc<dyn StepFactory>,
    prev: Arc<dyn Step>,
    repo: Arc<SourceRepository>,
    chosen: Mutex<Option<Arc<dyn Step>>>,
}

impl ConditionalStep {
    fn chosen(&self) -> Option<Arc<dyn Step>> {
        self.chosen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ArtifactSource for ConditionalStep {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        match self.chosen() {
            Some(step) => step.stream_to(destination).await,
            None => Ok(()),
        }
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        match self.chosen() {
            Some(step) => step.stream_file(path).await,
            None => Err(ExecError::FileNotFound(path.to_string())),
        }
    }
}

#[async_trait]
impl Step for ConditionalStep {
    async fn run(&self, signals: Signals, ready: Ready) -> Result<(), ExecError> {
        let matched = self.conditions.satisfied_by(presumed_success(&*self.prev));

        let chosen: Arc<dyn Step> = if matched {
            self.factory.using(self.prev.clone(), self.repo.clone())
        } else {
            Arc::new(NoopStep)
        };

        *self.chosen.lock().unwrap_or_else(|e| e.into_inner()) = Some(chosen.clone());

        chosen.run(signals, ready).await
    }

    async fn release(&self) {
        if let Some(step) = self.chosen() {
            step.release().await;
        }
    }

    fn result(&self, out: &mut dyn Any) -> bool {
        match self.chosen() {
            Some(step) => step.result(out),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::signal_channel;
    use crate::test_support::{FakeStep, FakeStepFactory, StepSpec};
    use atc_core::Condition;

    async fn run_conditional(
        conditions: Conditions,
        prev_spec: StepSpec,
    ) -> (Arc<FakeStepFactory>, Arc<dyn Step>) {
        let wrapped = FakeStepFactory::new(StepSpec::succeeding());
        let conditional = Conditional::new(conditions, wrapped.clone());

        let prev = FakeStep::standalone(prev_spec);
        let step = conditional.using(prev, SourceRepository::new());

        let (_handle, signals) = signal_channel();
        step.run(signals, Ready::detached()).await.unwrap();

        (wrapped, step)
    }

    #[tokio::test]
    async fn test_runs_wrapped_step_when_conditions_match() {
        let (wrapped, _) = run_conditional(
            Conditions(vec![Condition::Success]),
            StepSpec::succeeding().with_success(true),
        )
        .await;
        assert_eq!(wrapped.run_count(), 1);
    }

    #[tokio::test]
    async fn test_noops_when_conditions_do_not_match() {
        let (wrapped, step) = run_conditional(
            Conditions(vec![Condition::Failure]),
            StepSpec::succeeding().with_success(true),
        )
        .await;
        assert_eq!(wrapped.run_count(), 0);

        // the noop side has no results
        let mut success = crate::Success::default();
        assert!(!step.result(&mut success));
    }

    #[tokio::test]
    async fn test_failure_conditions_fire_on_failed_previous_step() {
        let (wrapped, _) = run_conditional(
            Conditions(vec![Condition::Failure]),
            StepSpec::succeeding().with_success(false),
        )
        .await;
        assert_eq!(wrapped.run_count(), 1);
    }

    #[tokio::test]
    async fn test_previous_step_without_opinion_is_presumed_successful() {
        let (wrapped, _) = run_conditional(
            Conditions(vec![Condition::Success]),
            StepSpec::succeeding(),
        )
        .await;
        assert_eq!(wrapped.run_count(), 1);

        let (wrapped, _) = run_conditional(
            Conditions(vec![Condition::Failure]),
            StepSpec::succeeding(),
        )
        .await;
        assert_eq!(wrapped.run_count(), 0);
    }

    #[tokio::test]
    async fn test_release_propagates_to_the_chosen_step() {
        let (wrapped, step) = run_conditional(
            Conditions(vec![Condition::Success]),
            StepSpec::succeeding().with_success(true),
        )
        .await;

        step.release().await;
        assert_eq!(wrapped.release_count(), 1);
    }
}
