//! Per-build source repository
//!
//! The named map of artifact sources exchanged between steps within one
//! build. Get steps register under their resource name, task steps under
//! the task name; task input staging and config-file fetching read from it.
//! Last write wins on name collisions. Parallel writers are only safe with
//! disjoint names, which pipeline validation enforces for aggregates.

use crate::ArtifactSource;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Name an artifact source is registered under inside a build.
pub type SourceName = String;

#[derive(Default)]
pub struct SourceRepository {
    sources: Mutex<HashMap<SourceName, Arc<dyn ArtifactSource>>>,
}

impl SourceRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_source(&self, name: impl Into<SourceName>, source: Arc<dyn ArtifactSource>) {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), source);
    }

    pub fn source_for(&self, name: &str) -> Option<Arc<dyn ArtifactSource>> {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}
