//! ATC DB
//!
//! The persistence contract the control plane runs against:
//! - `Db`: registration, versions, builds and their inputs/outputs,
//!   serial-group queries
//! - `Locker`: cluster-wide advisory locks for resource checking and job
//!   scheduling, handed out as droppable leases
//!
//! Two implementations: `postgres` (sqlx pool, advisory locks, schema
//! created in code) and `memory` (everything behind one mutex, for tests
//! and database-less runs).

pub mod memory;
pub mod postgres;

pub use memory::MemoryDb;
pub use postgres::PostgresDb;

use async_trait::async_trait;
use atc_core::{Build, BuildInput, BuildOutput, BuildStatus, JobInput, Version};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("build {0} not found")]
    BuildNotFound(i64),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence operations invoked by the core.
#[async_trait]
pub trait Db: Send + Sync {
    /// Idempotent upsert of a job and its serial-group memberships.
    async fn register_job(&self, name: &str, serial_groups: &[String]) -> Result<(), DbError>;

    /// Idempotent upsert of a resource.
    async fn register_resource(&self, name: &str) -> Result<(), DbError>;

    /// Persists a newly observed version, assigning the next check order.
    /// Re-observing a payload leaves the existing row untouched.
    async fn save_version(&self, resource: &str, version: &Version) -> Result<(), DbError>;

    /// The most recently observed version of a resource.
    async fn latest_version(&self, resource: &str) -> Result<Option<Version>, DbError>;

    /// Resolves each declared input to its most recent version satisfying
    /// the input's `passed` constraints (the version was an input of a
    /// succeeded build of every named upstream job). `None` when any input
    /// has no candidate.
    async fn latest_input_versions(
        &self,
        inputs: &[JobInput],
    ) -> Result<Option<Vec<BuildInput>>, DbError>;

    /// Creates a pending build. One-off builds pass no job name.
    async fn create_build(&self, job_name: Option<&str>) -> Result<Build, DbError>;

    async fn get_build(&self, id: i64) -> Result<Build, DbError>;

    /// The oldest pending, unscheduled build of one job.
    async fn next_pending_build(&self, job: &str) -> Result<Option<Build>, DbError>;

    /// An existing pending, unscheduled build of the job pinned to exactly
    /// this input set, if any. This is the duplicate-suppression query.
    async fn pending_build_for_inputs(
        &self,
        job: &str,
        inputs: &[BuildInput],
    ) -> Result<Option<Build>, DbError>;

    async fn save_build_inputs(&self, build_id: i64, inputs: &[BuildInput]) -> Result<(), DbError>;

    async fn build_inputs(&self, build_id: i64) -> Result<Vec<BuildInput>, DbError>;

    async fn save_build_output(&self, build_id: i64, output: &BuildOutput) -> Result<(), DbError>;

    async fn save_build_status(&self, build_id: i64, status: BuildStatus) -> Result<(), DbError>;

    /// Atomically flips a pending, unscheduled build to scheduled. Returns
    /// false when someone else got there first (or the build moved on).
    async fn schedule_build(&self, build_id: i64) -> Result<bool, DbError>;

    /// Builds of any job in the given serial groups that are scheduled and
    /// not yet terminal.
    async fn running_builds_in_serial_groups(
        &self,
        groups: &[String],
    ) -> Result<Vec<Build>, DbError>;

    /// The oldest pending, unscheduled build across all jobs in the given
    /// serial groups. Ties break by ascending build id.
    async fn next_pending_build_in_serial_groups(
        &self,
        groups: &[String],
    ) -> Result<Option<Build>, DbError>;
}

/// Advisory locks for cluster-wide mutual exclusion.
#[async_trait]
pub trait Locker: Send + Sync {
    /// The per-resource check lock the radar holds for the duration of a
    /// check. `None` when another ATC holds it.
    async fn try_acquire_resource_checking_lock(
        &self,
        resource: &str,
    ) -> Result<Option<Lease>, DbError>;

    /// The per-job lock the scheduler holds across one tick's decision.
    async fn try_acquire_scheduling_lock(&self, job: &str) -> Result<Option<Lease>, DbError>;
}

/// A held advisory lock.
///
/// Explicit `release` is the graceful path; dropping the lease releases it
/// too (for the postgres variant by closing the session holding the lock,
/// which is also what bounds a crashed holder's lease).
pub struct Lease {
    inner: Option<LeaseImpl>,
}

enum LeaseImpl {
    Memory {
        held: Arc<Mutex<HashSet<String>>>,
        key: String,
    },
    Postgres {
        conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
        key: i64,
    },
}

impl Lease {
    pub(crate) fn memory(held: Arc<Mutex<HashSet<String>>>, key: String) -> Self {
        Self {
            inner: Some(LeaseImpl::Memory { held, key }),
        }
    }

    pub(crate) fn postgres(conn: sqlx::pool::PoolConnection<sqlx::Postgres>, key: i64) -> Self {
        Self {
            inner: Some(LeaseImpl::Postgres { conn, key }),
        }
    }

    pub async fn release(mut self) {
        match self.inner.take() {
            Some(LeaseImpl::Memory { held, key }) => {
                held.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            }
            Some(LeaseImpl::Postgres { mut conn, key }) => {
                let result = sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(&mut *conn)
                    .await;
                if let Err(err) = result {
                    tracing::warn!(key, %err, "failed to release advisory lock");
                }
            }
            None => {}
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        match self.inner.take() {
            Some(LeaseImpl::Memory { held, key }) => {
                held.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            }
            Some(LeaseImpl::Postgres { conn, .. }) => {
                // closing the session releases every advisory lock it holds
                drop(conn.detach());
            }
            None => {}
        }
    }
}
