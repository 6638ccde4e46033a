//! The view of the engine that the job store and the result cache need.

use crate::engine::TimeSeriesEngine;
use crate::error::EngineError;
use async_trait::async_trait;
use jobmon_core::{Job, JobData, MetricSummary};
use std::time::Duration;

/// Provider of job data and metric summaries.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Parsed series of all of `job`'s nodes at `interval`.
    async fn job_data(&self, job: &Job, interval: Duration) -> Result<JobData, EngineError>;

    /// Summaries of a finished job.
    async fn metadata_metrics(&self, job: &Job) -> Result<Vec<MetricSummary>, EngineError>;
}

#[async_trait]
impl MetricsSource for TimeSeriesEngine {
    async fn job_data(&self, job: &Job, interval: Duration) -> Result<JobData, EngineError> {
        self.get_job_data(job, &[], interval, false).await
    }

    async fn metadata_metrics(&self, job: &Job) -> Result<Vec<MetricSummary>, EngineError> {
        self.get_job_metadata_metrics(job).await
    }
}
