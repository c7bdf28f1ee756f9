//! In-memory database
//!
//! A complete implementation of the persistence contract behind a single
//! mutex. Backs tests and database-less runs; it is the reference for the
//! ordering invariants (check order, build ids) the postgres variant
//! upholds with sequences.

use crate::{Db, DbError, Lease, Locker};
use async_trait::async_trait;
use atc_core::{Build, BuildInput, BuildOutput, BuildStatus, JobInput, Version};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct VersionRow {
    resource: String,
    payload: Version,
    check_order: i64,
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<String, Vec<String>>,
    resources: BTreeSet<String>,
    versions: Vec<VersionRow>,
    next_check_order: i64,
    builds: BTreeMap<i64, Build>,
    next_build_id: i64,
    build_inputs: BTreeMap<i64, Vec<BuildInput>>,
    build_outputs: BTreeMap<i64, Vec<BuildOutput>>,
}

#[derive(Default)]
pub struct MemoryDb {
    state: Mutex<State>,
    held_locks: Arc<Mutex<HashSet<String>>>,
}

impl MemoryDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All outputs saved for a build, for assertions.
    pub fn outputs_for(&self, build_id: i64) -> Vec<BuildOutput> {
        self.lock()
            .build_outputs
            .get(&build_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every persisted version of a resource, in check order.
    pub fn versions_of(&self, resource: &str) -> Vec<Version> {
        self.lock()
            .versions
            .iter()
            .filter(|row| row.resource == resource)
            .map(|row| row.payload.clone())
            .collect()
    }

    /// All builds, ascending by id.
    pub fn all_builds(&self) -> Vec<Build> {
        self.lock().builds.values().cloned().collect()
    }

    fn jobs_in_groups(state: &State, groups: &[String]) -> BTreeSet<String> {
        state
            .jobs
            .iter()
            .filter(|(_, job_groups)| job_groups.iter().any(|g| groups.contains(g)))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl Db for MemoryDb {
    async fn register_job(&self, name: &str, serial_groups: &[String]) -> Result<(), DbError> {
        self.lock()
            .jobs
            .insert(name.to_string(), serial_groups.to_vec());
        Ok(())
    }

    async fn register_resource(&self, name: &str) -> Result<(), DbError> {
        self.lock().resources.insert(name.to_string());
        Ok(())
    }

    async fn save_version(&self, resource: &str, version: &Version) -> Result<(), DbError> {
        let mut state = self.lock();

        let exists = state
            .versions
            .iter()
            .any(|row| row.resource == resource && &row.payload == version);
        if exists {
            return Ok(());
        }

        state.next_check_order += 1;
        let check_order = state.next_check_order;
        state.versions.push(VersionRow {
            resource: resource.to_string(),
            payload: version.clone(),
            check_order,
        });
        Ok(())
    }

    async fn latest_version(&self, resource: &str) -> Result<Option<Version>, DbError> {
        let state = self.lock();
        Ok(state
            .versions
            .iter()
            .filter(|row| row.resource == resource)
            .max_by_key(|row| row.check_order)
            .map(|row| row.payload.clone()))
    }

    async fn latest_input_versions(
        &self,
        inputs: &[JobInput],
    ) -> Result<Option<Vec<BuildInput>>, DbError> {
        let state = self.lock();
        let mut resolved = Vec::with_capacity(inputs.len());

        for input in inputs {
            let mut candidates: Vec<&VersionRow> = state
                .versions
                .iter()
                .filter(|row| row.resource == input.resource)
                .collect();
            candidates.sort_by_key(|row| std::cmp::Reverse(row.check_order));

            let passed_sets: Vec<BTreeSet<&Version>> = input
                .passed
                .iter()
                .map(|upstream| {
                    state
                        .builds
                        .values()
                        .filter(|build| {
                            build.job_name.as_deref() == Some(upstream.as_str())
                                && build.status == BuildStatus::Succeeded
                        })
                        .flat_map(|build| {
                            state
                                .build_inputs
                                .get(&build.id)
                                .into_iter()
                                .flatten()
                                .filter(|bi| bi.resource == input.resource)
                                .map(|bi| &bi.version)
                        })
                        .collect()
                })
                .collect();

            let candidate = candidates.into_iter().find(|row| {
                passed_sets.iter().all(|set| set.contains(&row.payload))
            });

            match candidate {
                Some(row) => resolved.push(BuildInput {
                    resource: input.resource.clone(),
                    version: row.payload.clone(),
                }),
                None => return Ok(None),
            }
        }

        Ok(Some(resolved))
    }

    async fn create_build(&self, job_name: Option<&str>) -> Result<Build, DbError> {
        let mut state = self.lock();
        state.next_build_id += 1;
        let build = Build {
            id: state.next_build_id,
            job_name: job_name.map(str::to_string),
            status: BuildStatus::Pending,
            scheduled: false,
            engine_metadata: String::new(),
        };
        state.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn get_build(&self, id: i64) -> Result<Build, DbError> {
        self.lock()
            .builds
            .get(&id)
            .cloned()
            .ok_or(DbError::BuildNotFound(id))
    }

    async fn next_pending_build(&self, job: &str) -> Result<Option<Build>, DbError> {
        let state = self.lock();
        Ok(state
            .builds
            .values()
            .filter(|build| {
                build.job_name.as_deref() == Some(job)
                    && build.status == BuildStatus::Pending
                    && !build.scheduled
            })
            .min_by_key(|build| build.id)
            .cloned())
    }

    async fn pending_build_for_inputs(
        &self,
        job: &str,
        inputs: &[BuildInput],
    ) -> Result<Option<Build>, DbError> {
        let state = self.lock();
        let wanted: BTreeSet<(&str, &Version)> = inputs
            .iter()
            .map(|i| (i.resource.as_str(), &i.version))
            .collect();

        Ok(state
            .builds
            .values()
            .find(|build| {
                build.job_name.as_deref() == Some(job)
                    && build.status == BuildStatus::Pending
                    && !build.scheduled
                    && {
                        let pinned: BTreeSet<(&str, &Version)> = state
                            .build_inputs
                            .get(&build.id)
                            .into_iter()
                            .flatten()
                            .map(|i| (i.resource.as_str(), &i.version))
                            .collect();
                        pinned == wanted
                    }
            })
            .cloned())
    }

    async fn save_build_inputs(&self, build_id: i64, inputs: &[BuildInput]) -> Result<(), DbError> {
        self.lock().build_inputs.insert(build_id, inputs.to_vec());
        Ok(())
    }

    async fn build_inputs(&self, build_id: i64) -> Result<Vec<BuildInput>, DbError> {
        Ok(self
            .lock()
            .build_inputs
            .get(&build_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_build_output(&self, build_id: i64, output: &BuildOutput) -> Result<(), DbError> {
        self.lock()
            .build_outputs
            .entry(build_id)
            .or_default()
            .push(output.clone());
        Ok(())
    }

    async fn save_build_status(&self, build_id: i64, status: BuildStatus) -> Result<(), DbError> {
        let mut state = self.lock();
        let build = state
            .builds
            .get_mut(&build_id)
            .ok_or(DbError::BuildNotFound(build_id))?;
        build.status = status;
        Ok(())
    }

    async fn schedule_build(&self, build_id: i64) -> Result<bool, DbError> {
        let mut state = self.lock();
        let build = state
            .builds
            .get_mut(&build_id)
            .ok_or(DbError::BuildNotFound(build_id))?;

        if build.status != BuildStatus::Pending || build.scheduled {
            return Ok(false);
        }
        build.scheduled = true;
        Ok(true)
    }

    async fn running_builds_in_serial_groups(
        &self,
        groups: &[String],
    ) -> Result<Vec<Build>, DbError> {
        let state = self.lock();
        let jobs = Self::jobs_in_groups(&state, groups);

        Ok(state
            .builds
            .values()
            .filter(|build| {
                build
                    .job_name
                    .as_ref()
                    .is_some_and(|job| jobs.contains(job))
                    && build.scheduled
                    && !build.status.is_terminal()
            })
            .cloned()
            .collect())
    }

    async fn next_pending_build_in_serial_groups(
        &self,
        groups: &[String],
    ) -> Result<Option<Build>, DbError> {
        let state = self.lock();
        let jobs = Self::jobs_in_groups(&state, groups);

        Ok(state
            .builds
            .values()
            .filter(|build| {
                build
                    .job_name
                    .as_ref()
                    .is_some_and(|job| jobs.contains(job))
                    && build.status == BuildStatus::Pending
                    && !build.scheduled
            })
            .min_by_key(|build| build.id)
            .cloned())
    }
}

#[async_trait]
impl Locker for MemoryDb {
    async fn try_acquire_resource_checking_lock(
        &self,
        resource: &str,
    ) -> Result<Option<Lease>, DbError> {
        self.try_lock(format!("resource-check/{resource}"))
    }

    async fn try_acquire_scheduling_lock(&self, job: &str) -> Result<Option<Lease>, DbError> {
        self.try_lock(format!("scheduling/{job}"))
    }
}

impl MemoryDb {
    fn try_lock(&self, key: String) -> Result<Option<Lease>, DbError> {
        let mut held = self
            .held_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if held.contains(&key) {
            return Ok(None);
        }

        held.insert(key.clone());
        Ok(Some(Lease::memory(self.held_locks.clone(), key)))
    }
}
