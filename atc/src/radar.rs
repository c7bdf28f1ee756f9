//! Radar
//!
//! Per-resource version detection. Each resource gets its own loop that
//! takes the cluster-wide check lock, re-acquires the (non-ephemeral)
//! check container for its session, runs the check script from the last
//! saved version, and persists whatever came back, in script order.
//! Errors are logged and retried on the next interval; a consecutive
//! failure count is kept for the "failing to check" surface.

use crate::scheduler::Scheduler;
use anyhow::{Context, Result};
use atc_core::{PipelineConfig, ResourceConfig};
use atc_db::{Db, Locker};
use atc_exec::{Session, Tracker};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct Radar {
    db: Arc<dyn Db>,
    locker: Arc<dyn Locker>,
    tracker: Arc<Tracker>,
    scheduler: Arc<Scheduler>,
    noop: bool,
    failures: Mutex<HashMap<String, u32>>,
}

impl Radar {
    pub fn new(
        db: Arc<dyn Db>,
        locker: Arc<dyn Locker>,
        tracker: Arc<Tracker>,
        scheduler: Arc<Scheduler>,
        noop: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            locker,
            tracker,
            scheduler,
            noop,
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// One scan of one resource. Returns how many new versions were saved,
    /// or zero when another ATC holds the check lock.
    pub async fn scan(&self, resource: &ResourceConfig) -> Result<usize> {
        let Some(lease) = self
            .locker
            .try_acquire_resource_checking_lock(&resource.name)
            .await
            .context("failed to acquire check lock")?
        else {
            debug!(resource = %resource.name, "check lock is taken, skipping");
            return Ok(0);
        };

        let result = self.check(resource).await;
        lease.release().await;

        match result {
            Ok(count) => {
                self.failures_mut().remove(&resource.name);
                Ok(count)
            }
            Err(err) => {
                let mut failures = self.failures_mut();
                let count = failures.entry(resource.name.clone()).or_insert(0);
                *count += 1;
                warn!(
                    resource = %resource.name,
                    consecutive_failures = *count,
                    "failing to check"
                );
                Err(err)
            }
        }
    }

    async fn check(&self, resource: &ResourceConfig) -> Result<usize> {
        let from = self.db.latest_version(&resource.name).await?;

        let handle = self
            .tracker
            .init(
                &Session::for_resource_check(&resource.name),
                &resource.resource_type,
                false,
            )
            .await
            .context("failed to initialize check container")?;

        let checked = handle.check(&resource.source, from.as_ref()).await;
        handle.release().await;

        let versions = checked.context("check script failed")?;
        let count = versions.len();

        for version in &versions {
            self.db.save_version(&resource.name, version).await?;
        }

        if count > 0 {
            info!(resource = %resource.name, new_versions = count, "saved new versions");
            if !self.noop {
                self.scheduler.resource_updated(&resource.name).await;
            }
        }

        Ok(count)
    }

    /// Whether the last scan of the resource failed.
    pub fn failing(&self, resource: &str) -> bool {
        self.failures_mut().get(resource).copied().unwrap_or(0) > 0
    }

    fn failures_mut(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns the per-resource check loops, ticking at the given interval
    /// until the drain channel fires.
    pub fn spawn_loops(
        self: &Arc<Self>,
        pipeline: &PipelineConfig,
        interval: Duration,
        drain: &watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        pipeline
            .resources
            .iter()
            .cloned()
            .map(|resource| {
                let radar = self.clone();
                let mut drain = drain.clone();

                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if let Err(err) = radar.scan(&resource).await {
                                    error!(resource = %resource.name, %err, "resource check failed");
                                }
                            }
                            _ = drain.changed() => {
                                debug!(resource = %resource.name, "radar loop draining");
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}
