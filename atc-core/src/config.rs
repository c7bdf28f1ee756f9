//! Pipeline configuration types
//!
//! Structure shared between the scheduler (decides what to build) and the
//! step engine (executes it). A pipeline is an ordered set of resources and
//! a set of jobs; each job carries a build plan of composable entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Opaque parameter mapping identifying a resource instance to its scripts.
pub type Source = BTreeMap<String, String>;

/// Opaque parameters passed through to resource scripts.
pub type Params = BTreeMap<String, String>;

/// A snapshot identifier for one state of a resource.
///
/// Versions are totally ordered by when they were first observed (the DB's
/// check order), never by their contents.
pub type Version = BTreeMap<String, String>;

/// A single name/value pair of post-completion resource metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// Full pipeline definition as loaded from the pipeline file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub resource_types: Vec<ResourceTypeConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Binds a resource type name to the container image carrying its
/// `/opt/resource` scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeConfig {
    pub name: String,
    pub image: String,
}

/// A named, typed, versioned external artifact stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
}

/// A named recipe for producing builds from resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub plan: Vec<PlanConfig>,
    #[serde(default)]
    pub serial: bool,
    #[serde(default)]
    pub serial_groups: Vec<String>,
    #[serde(default)]
    pub on_success: Option<PlanConfig>,
    #[serde(default)]
    pub on_failure: Option<PlanConfig>,
    #[serde(default)]
    pub ensure: Option<PlanConfig>,
}

/// One entry of a build plan.
///
/// Exactly one of `get`, `put`, `task`, `aggregate` or `do` identifies the
/// entry's kind; the remaining fields qualify it. `conditions` gates any
/// entry on the preceding step's success result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default)]
    pub get: Option<String>,
    #[serde(default)]
    pub put: Option<String>,
    #[serde(default)]
    pub task: Option<String>,

    /// Path of a task config file, `<artifact-source>/<path>`.
    #[serde(default)]
    pub file: Option<String>,
    /// Inline task config; merged over `file` when both are present.
    #[serde(default)]
    pub config: Option<crate::task::TaskConfig>,

    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub passed: Vec<String>,
    #[serde(default)]
    pub trigger: bool,

    #[serde(default)]
    pub aggregate: Option<Vec<PlanConfig>>,
    #[serde(default, rename = "do")]
    pub do_seq: Option<Vec<PlanConfig>>,

    #[serde(default)]
    pub conditions: Option<Conditions>,
}

impl PlanConfig {
    /// Name this entry registers or reads artifacts under.
    pub fn name(&self) -> Option<&str> {
        self.get
            .as_deref()
            .or(self.put.as_deref())
            .or(self.task.as_deref())
    }
}

/// A declared job input, derived from the `get` entries of its plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    pub name: String,
    pub resource: String,
    pub passed: Vec<String>,
    pub trigger: bool,
    pub params: Params,
}

impl JobConfig {
    /// Declared inputs, in plan order.
    pub fn inputs(&self) -> Vec<JobInput> {
        fn collect(entries: &[PlanConfig], out: &mut Vec<JobInput>) {
            for entry in entries {
                if let Some(resource) = &entry.get {
                    out.push(JobInput {
                        name: resource.clone(),
                        resource: resource.clone(),
                        passed: entry.passed.clone(),
                        trigger: entry.trigger,
                        params: entry.params.clone(),
                    });
                }
                if let Some(children) = &entry.aggregate {
                    collect(children, out);
                }
                if let Some(children) = &entry.do_seq {
                    collect(children, out);
                }
            }
        }

        let mut inputs = Vec::new();
        collect(&self.plan, &mut inputs);
        inputs
    }

    /// Serial groups this job participates in.
    ///
    /// `serial: true` makes the job's own name an implicit group.
    pub fn serial_group_names(&self) -> Vec<String> {
        let mut groups = self.serial_groups.clone();
        if self.serial && !groups.contains(&self.name) {
            groups.push(self.name.clone());
        }
        groups
    }

    /// Whether the job is constrained by any serial group.
    pub fn is_serial(&self) -> bool {
        self.serial || !self.serial_groups.is_empty()
    }
}

impl PipelineConfig {
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Jobs declaring the given resource as an input.
    pub fn jobs_using_resource(&self, resource: &str) -> Vec<&JobConfig> {
        self.jobs
            .iter()
            .filter(|j| j.inputs().iter().any(|i| i.resource == resource))
            .collect()
    }

    /// Structural validation of the pipeline.
    ///
    /// Checks name uniqueness, that every `get`/`put` references a declared
    /// resource, and that aggregate siblings register disjoint names (the
    /// source repository is only safe for writers with disjoint names).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for resource in &self.resources {
            if !seen.insert(&resource.name) {
                return Err(ConfigError::DuplicateResource(resource.name.clone()));
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for job in &self.jobs {
            if !seen.insert(&job.name) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }

            self.validate_entries(&job.name, &job.plan)?;
            for hook in [&job.on_success, &job.on_failure, &job.ensure]
                .into_iter()
                .flatten()
            {
                self.validate_entries(&job.name, std::slice::from_ref(hook))?;
            }
        }

        Ok(())
    }

    fn validate_entries(&self, job: &str, entries: &[PlanConfig]) -> Result<(), ConfigError> {
        for entry in entries {
            for resource in [&entry.get, &entry.put].into_iter().flatten() {
                if self.resource(resource).is_none() {
                    return Err(ConfigError::UnknownResource {
                        job: job.to_string(),
                        resource: resource.clone(),
                    });
                }
            }

            if let Some(children) = &entry.aggregate {
                let mut names = std::collections::BTreeSet::new();
                for child in children {
                    if let Some(name) = child.name() {
                        if !names.insert(name.to_string()) {
                            return Err(ConfigError::AmbiguousAggregateName {
                                job: job.to_string(),
                                name: name.to_string(),
                            });
                        }
                    }
                }
                self.validate_entries(job, children)?;
            }

            if let Some(children) = &entry.do_seq {
                self.validate_entries(job, children)?;
            }
        }

        Ok(())
    }
}

/// Pipeline-level validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("duplicate resource '{0}'")]
    DuplicateResource(String),

    #[error("duplicate job '{0}'")]
    DuplicateJob(String),

    #[error("job '{job}' references unknown resource '{resource}'")]
    UnknownResource { job: String, resource: String },

    #[error("job '{job}' aggregate registers '{name}' more than once")]
    AmbiguousAggregateName { job: String, name: String },
}

/// A step outcome a conditional entry may fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Success,
    Failure,
}

/// The set of outcomes a conditional entry fires on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions(pub Vec<Condition>);

impl Conditions {
    pub fn satisfied_by(&self, succeeded: bool) -> bool {
        self.0.iter().any(|c| match c {
            Condition::Success => succeeded,
            Condition::Failure => !succeeded,
        })
    }
}
