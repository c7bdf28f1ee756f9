//! Postgres database
//!
//! sqlx-backed implementation of the persistence contract. The schema is
//! created in code at startup; advisory locks ride on dedicated pooled
//! connections so a lease expires with its session.

use crate::{Db, DbError, Lease, Locker};
use async_trait::async_trait;
use atc_core::{Build, BuildInput, BuildOutput, BuildStatus, JobInput, Version};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Connects and migrates, retrying dial-type failures every five seconds.
/// Any other failure is fatal to the caller.
pub async fn connect_with_retry(database_url: &str) -> Result<Arc<PostgresDb>, DbError> {
    loop {
        match create_pool(database_url).await {
            Ok(pool) => {
                let db = PostgresDb::new(pool);
                db.run_migrations().await?;
                return Ok(db);
            }
            Err(sqlx::Error::Io(err)) => {
                tracing::warn!(%err, "database is not reachable yet, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

pub struct PostgresDb {
    pool: PgPool,
}

impl PostgresDb {
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                name TEXT PRIMARY KEY
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_serial_groups (
                job_name TEXT NOT NULL REFERENCES jobs(name) ON DELETE CASCADE,
                serial_group TEXT NOT NULL,
                UNIQUE (job_name, serial_group)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                name TEXT PRIMARY KEY
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS versions (
                check_order BIGSERIAL PRIMARY KEY,
                resource_name TEXT NOT NULL REFERENCES resources(name) ON DELETE CASCADE,
                payload JSONB NOT NULL,
                observed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (resource_name, payload)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS builds (
                id BIGSERIAL PRIMARY KEY,
                job_name TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled BOOLEAN NOT NULL DEFAULT FALSE,
                engine_metadata TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS build_inputs (
                build_id BIGINT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                resource_name TEXT NOT NULL,
                payload JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS build_outputs (
                build_id BIGINT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                resource_name TEXT NOT NULL,
                payload JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_versions_resource ON versions(resource_name, check_order DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_job_status ON builds(job_name, status)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_inputs_build ON build_inputs(build_id)")
            .execute(&self.pool)
            .await?;

        tracing::info!("database migrations completed");
        Ok(())
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<Option<Lease>, DbError> {
        let mut conn = self.pool.acquire().await?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if acquired {
            Ok(Some(Lease::postgres(conn, key)))
        } else {
            Ok(None)
        }
    }
}

/// Stable 64-bit key for an advisory lock name. FNV-1a, so every ATC in
/// the cluster maps the same name to the same key regardless of binary.
fn lock_key(name: &str) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}

fn payload_to_json(version: &Version) -> Result<serde_json::Value, DbError> {
    Ok(serde_json::to_value(version)?)
}

fn payload_from_json(value: serde_json::Value) -> Result<Version, DbError> {
    Ok(serde_json::from_value(value)?)
}

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: i64,
    job_name: Option<String>,
    status: String,
    scheduled: bool,
    engine_metadata: String,
}

impl From<BuildRow> for Build {
    fn from(row: BuildRow) -> Self {
        Build {
            id: row.id,
            job_name: row.job_name,
            status: BuildStatus::parse(&row.status).unwrap_or(BuildStatus::Errored),
            scheduled: row.scheduled,
            engine_metadata: row.engine_metadata,
        }
    }
}

const BUILD_COLUMNS: &str = "id, job_name, status, scheduled, engine_metadata";

#[async_trait]
impl Db for PostgresDb {
    async fn register_job(&self, name: &str, serial_groups: &[String]) -> Result<(), DbError> {
        sqlx::query("INSERT INTO jobs (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;

        sqlx::query("DELETE FROM job_serial_groups WHERE job_name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        for group in serial_groups {
            sqlx::query(
                "INSERT INTO job_serial_groups (job_name, serial_group) VALUES ($1, $2)
                 ON CONFLICT (job_name, serial_group) DO NOTHING",
            )
            .bind(name)
            .bind(group)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn register_resource(&self, name: &str) -> Result<(), DbError> {
        sqlx::query("INSERT INTO resources (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_version(&self, resource: &str, version: &Version) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO versions (resource_name, payload) VALUES ($1, $2)
             ON CONFLICT (resource_name, payload) DO NOTHING",
        )
        .bind(resource)
        .bind(payload_to_json(version)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_version(&self, resource: &str) -> Result<Option<Version>, DbError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT payload FROM versions WHERE resource_name = $1
             ORDER BY check_order DESC LIMIT 1",
        )
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(payload,)| payload_from_json(payload)).transpose()
    }

    async fn latest_input_versions(
        &self,
        inputs: &[JobInput],
    ) -> Result<Option<Vec<BuildInput>>, DbError> {
        let mut resolved = Vec::with_capacity(inputs.len());

        for input in inputs {
            let candidates: Vec<(serde_json::Value,)> = sqlx::query_as(
                "SELECT payload FROM versions WHERE resource_name = $1
                 ORDER BY check_order DESC",
            )
            .bind(&input.resource)
            .fetch_all(&self.pool)
            .await?;

            let mut passed_sets: Vec<BTreeSet<Version>> = Vec::with_capacity(input.passed.len());
            for upstream in &input.passed {
                let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
                    "SELECT bi.payload FROM build_inputs bi
                     JOIN builds b ON b.id = bi.build_id
                     WHERE b.job_name = $1 AND b.status = 'succeeded'
                       AND bi.resource_name = $2",
                )
                .bind(upstream)
                .bind(&input.resource)
                .fetch_all(&self.pool)
                .await?;

                passed_sets.push(
                    rows.into_iter()
                        .map(|(payload,)| payload_from_json(payload))
                        .collect::<Result<_, _>>()?,
                );
            }

            let mut found = None;
            for (payload,) in candidates {
                let version = payload_from_json(payload)?;
                if passed_sets.iter().all(|set| set.contains(&version)) {
                    found = Some(version);
                    break;
                }
            }

            match found {
                Some(version) => resolved.push(BuildInput {
                    resource: input.resource.clone(),
                    version,
                }),
                None => return Ok(None),
            }
        }

        Ok(Some(resolved))
    }

    async fn create_build(&self, job_name: Option<&str>) -> Result<Build, DbError> {
        let row: BuildRow = sqlx::query_as(&format!(
            "INSERT INTO builds (job_name) VALUES ($1) RETURNING {BUILD_COLUMNS}"
        ))
        .bind(job_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_build(&self, id: i64) -> Result<Build, DbError> {
        let row: Option<BuildRow> =
            sqlx::query_as(&format!("SELECT {BUILD_COLUMNS} FROM builds WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Into::into).ok_or(DbError::BuildNotFound(id))
    }

    async fn next_pending_build(&self, job: &str) -> Result<Option<Build>, DbError> {
        let row: Option<BuildRow> = sqlx::query_as(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds
             WHERE job_name = $1 AND status = 'pending' AND NOT scheduled
             ORDER BY id ASC
             LIMIT 1"
        ))
        .bind(job)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn pending_build_for_inputs(
        &self,
        job: &str,
        inputs: &[BuildInput],
    ) -> Result<Option<Build>, DbError> {
        let rows: Vec<BuildRow> = sqlx::query_as(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds
             WHERE job_name = $1 AND status = 'pending' AND NOT scheduled
             ORDER BY id ASC"
        ))
        .bind(job)
        .fetch_all(&self.pool)
        .await?;

        let wanted: BTreeSet<(String, Version)> = inputs
            .iter()
            .map(|i| (i.resource.clone(), i.version.clone()))
            .collect();

        for row in rows {
            let pinned = self.build_inputs(row.id).await?;
            let pinned: BTreeSet<(String, Version)> = pinned
                .into_iter()
                .map(|i| (i.resource, i.version))
                .collect();

            if pinned == wanted {
                return Ok(Some(row.into()));
            }
        }

        Ok(None)
    }

    async fn save_build_inputs(&self, build_id: i64, inputs: &[BuildInput]) -> Result<(), DbError> {
        sqlx::query("DELETE FROM build_inputs WHERE build_id = $1")
            .bind(build_id)
            .execute(&self.pool)
            .await?;

        for input in inputs {
            sqlx::query(
                "INSERT INTO build_inputs (build_id, resource_name, payload) VALUES ($1, $2, $3)",
            )
            .bind(build_id)
            .bind(&input.resource)
            .bind(payload_to_json(&input.version)?)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn build_inputs(&self, build_id: i64) -> Result<Vec<BuildInput>, DbError> {
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            "SELECT resource_name, payload FROM build_inputs WHERE build_id = $1",
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(resource, payload)| {
                Ok(BuildInput {
                    resource,
                    version: payload_from_json(payload)?,
                })
            })
            .collect()
    }

    async fn save_build_output(&self, build_id: i64, output: &BuildOutput) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO build_outputs (build_id, resource_name, payload) VALUES ($1, $2, $3)",
        )
        .bind(build_id)
        .bind(&output.resource)
        .bind(payload_to_json(&output.version)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_build_status(&self, build_id: i64, status: BuildStatus) -> Result<(), DbError> {
        sqlx::query("UPDATE builds SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(build_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn schedule_build(&self, build_id: i64) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE builds SET scheduled = TRUE
             WHERE id = $1 AND status = 'pending' AND NOT scheduled",
        )
        .bind(build_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn running_builds_in_serial_groups(
        &self,
        groups: &[String],
    ) -> Result<Vec<Build>, DbError> {
        let rows: Vec<BuildRow> = sqlx::query_as(&format!(
            "SELECT DISTINCT b.id, b.job_name, b.status, b.scheduled, b.engine_metadata
             FROM builds b
             JOIN job_serial_groups g ON g.job_name = b.job_name
             WHERE g.serial_group = ANY($1)
               AND b.scheduled
               AND b.status NOT IN ('succeeded', 'failed', 'errored', 'aborted')
             ORDER BY b.id ASC"
        ))
        .bind(groups)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn next_pending_build_in_serial_groups(
        &self,
        groups: &[String],
    ) -> Result<Option<Build>, DbError> {
        let row: Option<BuildRow> = sqlx::query_as(&format!(
            "SELECT b.id, b.job_name, b.status, b.scheduled, b.engine_metadata
             FROM builds b
             JOIN job_serial_groups g ON g.job_name = b.job_name
             WHERE g.serial_group = ANY($1)
               AND b.status = 'pending' AND NOT b.scheduled
             ORDER BY b.id ASC
             LIMIT 1"
        ))
        .bind(groups)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl Locker for PostgresDb {
    async fn try_acquire_resource_checking_lock(
        &self,
        resource: &str,
    ) -> Result<Option<Lease>, DbError> {
        self.try_advisory_lock(lock_key(&format!("resource-check/{resource}")))
            .await
    }

    async fn try_acquire_scheduling_lock(&self, job: &str) -> Result<Option<Lease>, DbError> {
        self.try_advisory_lock(lock_key(&format!("scheduling/{job}")))
            .await
    }
}
