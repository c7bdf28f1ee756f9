//! Build records
//!
//! A build is a single attempted execution of a job (or a one-off with no
//! job). The scheduler creates builds as `Pending`, flips them to scheduled
//! once inputs are pinned and serial constraints hold, and the engine is the
//! single writer of every later status.

use crate::config::Version;
use serde::{Deserialize, Serialize};

/// Build execution status.
///
/// Transitions are forward-only: `Pending` → `Started` → one of the terminal
/// statuses; a build may also go terminal straight from `Pending` (aborted
/// before start, errored while scheduling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded
                | BuildStatus::Failed
                | BuildStatus::Errored
                | BuildStatus::Aborted
        )
    }

    /// Whether moving to `next` preserves the forward-only status order.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        match self {
            BuildStatus::Pending => next != BuildStatus::Pending,
            BuildStatus::Started => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<BuildStatus> {
        match s {
            "pending" => Some(BuildStatus::Pending),
            "started" => Some(BuildStatus::Started),
            "succeeded" => Some(BuildStatus::Succeeded),
            "failed" => Some(BuildStatus::Failed),
            "errored" => Some(BuildStatus::Errored),
            "aborted" => Some(BuildStatus::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single attempted execution of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    /// Absent for one-off builds.
    pub job_name: Option<String>,
    pub status: BuildStatus,
    /// Set once inputs are pinned and the serial-group constraint held.
    pub scheduled: bool,
    /// Opaque engine state, persisted so an execution can be re-attached.
    pub engine_metadata: String,
}

impl Build {
    pub fn one_off(&self) -> bool {
        self.job_name.is_none()
    }
}

/// An input version pinned to a build at scheduling time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInput {
    pub resource: String,
    pub version: Version,
}

/// A version produced by a build's put step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub resource: String,
    pub version: Version,
}
