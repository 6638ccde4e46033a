//! Job lifecycle rules shared by every store backend.
//!
//! A job is running until it is stopped, finalized once its summaries are
//! attached and reaped when its TTL has passed. The janitors move jobs
//! along that path without ever failing the caller.

use crate::error::StoreError;
use crate::store::JobStore;
use jobmon_core::{CatalogHandle, Job, JobFilter, StopJob};
use jobmon_engine::MetricsSource;
use std::sync::Arc;

/// Exit code recorded for jobs stopped by the overtime finisher.
pub const OVERTIME_EXIT_CODE: i32 = 1;

/// Jobs touched by one janitor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JanitorReport {
    /// Expired jobs that were deleted
    pub reaped: Vec<i64>,
    /// Overtime jobs that were stopped
    pub finished: Vec<i64>,
}

#[derive(Clone)]
pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    source: Arc<dyn MetricsSource>,
    catalog: CatalogHandle,
    default_ttl: i64,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<dyn JobStore>,
        source: Arc<dyn MetricsSource>,
        catalog: CatalogHandle,
        default_ttl: i64,
    ) -> Self {
        Self {
            store,
            source,
            catalog,
            default_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Register a running job. A zero TTL is replaced with the default.
    pub async fn start_job(&self, mut job: Job) -> Result<Job, StoreError> {
        if job.ttl == 0 {
            job.ttl = self.default_ttl;
        }
        job.validate()?;
        self.store.put_job(job.clone()).await?;
        tracing::info!(job = job.id, user = %job.user_name, "Job started");
        Ok(job)
    }

    /// Stop a running job, then attach its metric summaries.
    ///
    /// The stop is committed before enrichment; a failed enrichment leaves
    /// the job stopped without summaries.
    pub async fn stop_job(&self, id: i64, stop: StopJob) -> Result<Job, StoreError> {
        let job = self.store.mark_stopped(id, stop).await?;
        tracing::info!(job = id, exit_code = stop.exit_code, "Job stopped");
        match self.enrich(&job).await {
            Ok(job) => Ok(job),
            Err(e) => {
                tracing::warn!(job = id, "Failed to enrich stopped job: {}", e);
                Ok(job)
            }
        }
    }

    /// Recompute the summaries of a stopped job.
    pub async fn refresh_metadata(&self, id: i64) -> Result<Job, StoreError> {
        let job = self.store.get_job(id).await?;
        if job.is_running {
            return Err(StoreError::StillRunning(id));
        }
        self.enrich(&job).await
    }

    /// Attach fresh summaries to `job`, leaving the rest of the stored
    /// record as it is now.
    async fn enrich(&self, job: &Job) -> Result<Job, StoreError> {
        let summaries = self.source.metadata_metrics(job).await?;
        tracing::debug!(job = job.id, metrics = summaries.len(), "Attached metric summaries");
        self.store.set_summaries(job.id, Some(summaries)).await
    }

    /// Delete stopped jobs whose TTL has passed.
    pub async fn reap_expired(&self, now: i64) -> Result<Vec<i64>, StoreError> {
        let stopped = JobFilter {
            is_running: Some(false),
            ..Default::default()
        };
        let mut reaped = Vec::new();
        for job in self.store.get_filtered_jobs(&stopped).await? {
            if !job.expired(now) {
                continue;
            }
            match self.store.delete_job(job.id).await {
                Ok(true) => reaped.push(job.id),
                Ok(false) => {}
                Err(e) => tracing::error!(job = job.id, "Failed to reap job: {}", e),
            }
        }
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "Reaped expired jobs");
        }
        Ok(reaped)
    }

    /// Stop running jobs that outlived their partition's maximum runtime.
    ///
    /// The stop time is the start time plus the maximum runtime.
    pub async fn finish_overtime(&self, now: i64) -> Result<Vec<i64>, StoreError> {
        let running = JobFilter {
            is_running: Some(true),
            ..Default::default()
        };
        let catalog = self.catalog.snapshot();
        let mut finished = Vec::new();
        for job in self.store.get_filtered_jobs(&running).await? {
            let max_time = catalog.max_time(&job);
            if !job.overtime(max_time, now) {
                continue;
            }
            let stop = StopJob {
                exit_code: OVERTIME_EXIT_CODE,
                stop_time: job.start_time + max_time,
            };
            match self.stop_job(job.id, stop).await {
                Ok(_) => finished.push(job.id),
                Err(e) => tracing::error!(job = job.id, "Failed to finish overtime job: {}", e),
            }
        }
        if !finished.is_empty() {
            tracing::info!(count = finished.len(), "Finished overtime jobs");
        }
        Ok(finished)
    }

    /// One pass of both janitors. Failures are logged.
    pub async fn run_janitors(&self, now: i64) -> JanitorReport {
        let reaped = self.reap_expired(now).await.unwrap_or_else(|e| {
            tracing::error!("Reaper failed: {}", e);
            Vec::new()
        });
        let finished = self.finish_overtime(now).await.unwrap_or_else(|e| {
            tracing::error!("Overtime finisher failed: {}", e);
            Vec::new()
        });
        JanitorReport { reaped, finished }
    }

    /// Enrich stopped jobs that have no summaries yet. Returns how many
    /// were enriched.
    pub async fn enrich_missing(&self) -> Result<usize, StoreError> {
        let stopped = JobFilter {
            is_running: Some(false),
            ..Default::default()
        };
        let mut count = 0;
        for job in self.store.get_filtered_jobs(&stopped).await? {
            if job.summaries.is_some() {
                continue;
            }
            match self.enrich(&job).await {
                Ok(_) => count += 1,
                Err(e) => tracing::warn!(job = job.id, "Failed to enrich job: {}", e),
            }
        }
        Ok(count)
    }
}
