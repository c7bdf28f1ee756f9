//! ATC Core
//!
//! Core types for the ATC control plane.
//!
//! This crate contains:
//! - Pipeline configuration: resources, jobs and their build plans
//! - Task configuration: the containerised-command config with validation
//!   and merge semantics
//! - Build records: statuses, pinned inputs and produced outputs

pub mod build;
pub mod config;
pub mod task;

pub use build::{Build, BuildInput, BuildOutput, BuildStatus};
pub use config::{
    Condition, Conditions, JobConfig, JobInput, MetadataField, Params, PipelineConfig, PlanConfig,
    ResourceConfig, ResourceTypeConfig, Source, Version,
};
pub use task::{TaskConfig, TaskConfigError, TaskInputConfig, TaskRunConfig};
