//! Task configuration
//!
//! The config for a containerised command, either inlined in the pipeline or
//! fetched from an artifact produced earlier in the build. Unknown keys are
//! rejected at parse time; `platform` and `run.path` are required.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Config for a task step's containerised command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub run: TaskRunConfig,
    #[serde(default)]
    pub inputs: Vec<TaskInputConfig>,
}

/// The command a task runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskRunConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A named artifact the task expects staged into its working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskInputConfig {
    pub name: String,
    /// Directory to stage the input under, relative to the working
    /// directory; defaults to the input's name.
    #[serde(default)]
    pub path: Option<String>,
}

impl TaskInputConfig {
    pub fn destination(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

impl TaskConfig {
    /// Overlays `other` on top of this config.
    ///
    /// Params are merged key-by-key; inputs and tags are replaced wholesale
    /// when `other` declares any; scalars are last-wins when non-empty.
    pub fn merge(mut self, other: TaskConfig) -> TaskConfig {
        if !other.platform.is_empty() {
            self.platform = other.platform;
        }
        if !other.image.is_empty() {
            self.image = other.image;
        }
        if !other.run.path.is_empty() {
            self.run = other.run;
        }
        if !other.tags.is_empty() {
            self.tags = other.tags;
        }
        if !other.inputs.is_empty() {
            self.inputs = other.inputs;
        }
        self.params.extend(other.params);
        self
    }

    pub fn validate(&self) -> Result<(), TaskConfigError> {
        if self.platform.is_empty() {
            return Err(TaskConfigError::MissingPlatform);
        }
        if self.run.path.is_empty() {
            return Err(TaskConfigError::MissingRunPath);
        }
        Ok(())
    }
}

/// Task config validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskConfigError {
    #[error("missing 'platform'")]
    MissingPlatform,

    #[error("missing path to executable to run")]
    MissingRunPath,
}
