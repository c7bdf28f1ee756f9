//! Build factory
//!
//! Compiles a job definition plus its resolved input versions into a step
//! tree: plan entries chained with compose, aggregates fanned out, entry
//! conditions wrapped as conditionals, and the job's hooks bound to the
//! body's outcome.

use crate::aggregate::Aggregate;
use crate::compose::Compose;
use crate::conditional::Conditional;
use crate::config_source::{
    FileConfigSource, MergedConfigSource, StaticConfigSource, TaskConfigSource,
};
use crate::resource::{Session, Tracker};
use crate::resource_step::{GetStepFactory, PutStepFactory};
use crate::signals::{Ready, Signals};
use crate::task_step::TaskStepFactory;
use crate::{
    ArtifactDestination, ArtifactSource, ExecError, ResourceDelegate, SourceRepository, Step,
    StepFactory, TaskDelegate,
};
use async_trait::async_trait;
use atc_core::{BuildInput, Condition, Conditions, JobConfig, PlanConfig, ResourceConfig};
use atc_worker::Worker;
use std::any::Any;
use std::sync::{Arc, Mutex};

/// Hands out per-step delegates for one build. Implemented by the engine,
/// which persists outcomes and wires output streams.
pub trait BuildDelegate: Send + Sync {
    fn resource_delegate(&self, step_name: &str) -> Arc<dyn ResourceDelegate>;
    fn task_delegate(&self, step_name: &str) -> Arc<dyn TaskDelegate>;
}

/// Produces the primitive step factories, bound to the tracker and worker.
pub struct ExecFactory {
    tracker: Arc<Tracker>,
    worker: Arc<dyn Worker>,
}

impl ExecFactory {
    pub fn new(tracker: Arc<Tracker>, worker: Arc<dyn Worker>) -> Arc<Self> {
        Arc::new(Self { tracker, worker })
    }
}

/// Compiles jobs into step trees.
pub struct BuildFactory {
    resources: Vec<ResourceConfig>,
    exec: Arc<ExecFactory>,
}

impl BuildFactory {
    pub fn new(resources: Vec<ResourceConfig>, exec: Arc<ExecFactory>) -> Self {
        Self { resources, exec }
    }

    /// Compiles the job's plan (and hooks) for one build, with the given
    /// pinned input versions.
    pub fn create(
        &self,
        job: &JobConfig,
        build_id: i64,
        inputs: &[BuildInput],
        delegate: &Arc<dyn BuildDelegate>,
    ) -> Result<Arc<dyn StepFactory>, ExecError> {
        let body = self.compile_entries(&job.plan, build_id, inputs, delegate)?;

        let mut hooks: Vec<(Conditions, Arc<dyn StepFactory>)> = Vec::new();
        if let Some(entry) = &job.on_success {
            hooks.push((
                Conditions(vec![Condition::Success]),
                self.compile_entry(entry, build_id, inputs, delegate)?,
            ));
        }
        if let Some(entry) = &job.on_failure {
            hooks.push((
                Conditions(vec![Condition::Failure]),
                self.compile_entry(entry, build_id, inputs, delegate)?,
            ));
        }
        if let Some(entry) = &job.ensure {
            hooks.push((
                Conditions(vec![Condition::Success, Condition::Failure]),
                self.compile_entry(entry, build_id, inputs, delegate)?,
            ));
        }

        if hooks.is_empty() {
            Ok(body)
        } else {
            Ok(Arc::new(HookedFactory { body, hooks }))
        }
    }

    fn compile_entries(
        &self,
        entries: &[PlanConfig],
        build_id: i64,
        inputs: &[BuildInput],
        delegate: &Arc<dyn BuildDelegate>,
    ) -> Result<Arc<dyn StepFactory>, ExecError> {
        let compiled = entries
            .iter()
            .map(|entry| self.compile_entry(entry, build_id, inputs, delegate))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Compose::chain(compiled))
    }

    fn compile_entry(
        &self,
        entry: &PlanConfig,
        build_id: i64,
        inputs: &[BuildInput],
        delegate: &Arc<dyn BuildDelegate>,
    ) -> Result<Arc<dyn StepFactory>, ExecError> {
        let factory: Arc<dyn StepFactory> = if let Some(resource) = &entry.get {
            let config = self.resource_config(resource)?;
            let step_name = format!("get:{resource}");
            let version = inputs
                .iter()
                .find(|input| &input.resource == resource)
                .map(|input| input.version.clone());

            GetStepFactory::new(
                self.exec.tracker.clone(),
                Session::for_build(build_id, &step_name),
                config,
                entry.params.clone(),
                version,
                delegate.resource_delegate(&step_name),
            )
        } else if let Some(resource) = &entry.put {
            let config = self.resource_config(resource)?;
            let step_name = format!("put:{resource}");

            PutStepFactory::new(
                self.exec.tracker.clone(),
                Session::for_build(build_id, &step_name),
                config,
                entry.params.clone(),
                delegate.resource_delegate(&step_name),
            )
        } else if let Some(task) = &entry.task {
            let step_name = format!("task:{task}");

            let config_source: Arc<dyn TaskConfigSource> = match (&entry.file, &entry.config) {
                (Some(file), Some(config)) => Arc::new(MergedConfigSource::new(
                    Arc::new(FileConfigSource::new(file.clone())),
                    Arc::new(StaticConfigSource::new(config.clone())),
                )),
                (Some(file), None) => Arc::new(FileConfigSource::new(file.clone())),
                (None, Some(config)) => Arc::new(StaticConfigSource::new(config.clone())),
                (None, None) => {
                    return Err(ExecError::InvalidPlan(format!(
                        "task '{task}' has neither a config nor a file"
                    )))
                }
            };

            TaskStepFactory::new(
                self.exec.worker.clone(),
                Session::for_build(build_id, &step_name),
                task.clone(),
                config_source,
                false,
                delegate.task_delegate(&step_name),
            )
        } else if let Some(children) = &entry.aggregate {
            let members = children
                .iter()
                .enumerate()
                .map(|(i, child)| {
                    let name = child
                        .name()
                        .map(str::to_string)
                        .unwrap_or_else(|| i.to_string());
                    self.compile_entry(child, build_id, inputs, delegate)
                        .map(|factory| (name, factory))
                })
                .collect::<Result<Vec<_>, _>>()?;

            Aggregate::new(members)
        } else if let Some(children) = &entry.do_seq {
            self.compile_entries(children, build_id, inputs, delegate)?
        } else {
            return Err(ExecError::InvalidPlan(
                "plan entry does not specify an action".to_string(),
            ));
        };

        Ok(match &entry.conditions {
            Some(conditions) => Conditional::new(conditions.clone(), factory),
            None => factory,
        })
    }

    fn resource_config(&self, name: &str) -> Result<ResourceConfig, ExecError> {
        self.resources
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| ExecError::UnknownResource(name.to_string()))
    }
}

/// A job body with its hooks. Each hook is a conditional bound to the body
/// itself, so `on_success` and `on_failure` both read the body's result
/// rather than each other's. An erroring body skips every hook; hooks fire
/// on outcomes, not on infrastructure trouble.
struct HookedFactory {
    body: Arc<dyn StepFactory>,
    hooks: Vec<(Conditions, Arc<dyn StepFactory>)>,
}

impl StepFactory for HookedFactory {
    fn using(&self, prev: Arc<dyn Step>, repo: Arc<SourceRepository>) -> Arc<dyn Step> {
        Arc::new(HookedStep {
            body: self.body.clone(),
            hooks: self.hooks.clone(),
            prev,
            repo,
            state: Mutex::new(HookedState::default()),
        })
    }
}

#[derive(Default)]
struct HookedState {
    body: Option<Arc<dyn Step>>,
    hooks: Vec<Arc<dyn Step>>,
}

struct HookedStep {
    body: Arc<dyn StepFactory>,
    hooks: Vec<(Conditions, Arc<dyn StepFactory>)>,
    prev: Arc<dyn Step>,
    repo: Arc<SourceRepository>,
    state: Mutex<HookedState>,
}

#[async_trait]
impl ArtifactSource for HookedStep {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> Result<(), ExecError> {
        let body = lock(&self.state).body.clone();
        match body {
            Some(step) => step.stream_to(destination).await,
            None => Ok(()),
        }
    }

    async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        let body = lock(&self.state).body.clone();
        match body {
            Some(step) => step.stream_file(path).await,
            None => Err(ExecError::FileNotFound(path.to_string())),
        }
    }
}

#[async_trait]
impl Step for HookedStep {
    async fn run(&self, signals: Signals, ready: Ready) -> Result<(), ExecError> {
        let body = self.body.using(self.prev.clone(), self.repo.clone());
        lock(&self.state).body = Some(body.clone());

        body.run(signals.clone(), ready).await?;

        for (conditions, factory) in &self.hooks {
            let hook = Conditional::new(conditions.clone(), factory.clone())
                .using(body.clone(), self.repo.clone());
            lock(&self.state).hooks.push(hook.clone());

            hook.run(signals.clone(), Ready::detached()).await?;
        }

        Ok(())
    }

    async fn release(&self) {
        let (body, hooks) = {
            let state = lock(&self.state);
            (state.body.clone(), state.hooks.clone())
        };

        if let Some(step) = body {
            step.release().await;
        }
        for hook in hooks {
            hook.release().await;
        }
    }

    fn result(&self, out: &mut dyn Any) -> bool {
        let body = lock(&self.state).body.clone();
        match body {
            Some(step) => step.result(out),
            None => false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
