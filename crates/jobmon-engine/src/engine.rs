use crate::error::EngineError;
use crate::plan::{self, MetricPlan, Output, QuantilePlan, Scope, SummaryPlan};
use chrono::Utc;
use jobmon_analysis::detect_change_points;
use jobmon_core::{CatalogHandle, Configuration, Job, JobData, MetricCatalog, MetricData, MetricSummary, QuantileData};
use jobmon_flux::{AggFn, FluxBackend, FluxError, QueryBuilder, Task, group_by_key};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// Backend coordinates and query defaults.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub bucket: String,
    pub org: String,
    pub default_interval: Duration,
    /// Quantiles computed for finished jobs, e.g. `["0.25", "0.5", "0.75"]`
    pub quantiles: Vec<String>,
}

impl EngineSettings {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            bucket: config.db.bucket.clone(),
            org: config.db.org.clone(),
            default_interval: config.default_interval(),
            quantiles: config.metric_quantiles.clone(),
        }
    }
}

/// Queries job metrics from a Flux backend.
///
/// Cloning is cheap; clones share the backend, the catalog and the task
/// registry.
#[derive(Clone)]
pub struct TimeSeriesEngine {
    pub(crate) backend: Arc<dyn FluxBackend>,
    pub(crate) catalog: CatalogHandle,
    pub(crate) builder: QueryBuilder,
    pub(crate) settings: EngineSettings,
    pub(crate) org_id: String,
    /// Aggregation tasks known to exist on the backend
    pub(crate) tasks: Arc<Mutex<Vec<Task>>>,
}

impl TimeSeriesEngine {
    /// Verify the backend is reachable and the organization and bucket
    /// exist, then reconcile aggregation tasks.
    ///
    /// Connectivity failures are returned; reconciliation failures are
    /// logged.
    pub async fn connect(
        backend: Arc<dyn FluxBackend>,
        catalog: CatalogHandle,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        backend.ping().await?;
        let org = backend.find_organization(&settings.org).await?;
        let bucket = backend.find_bucket(&settings.bucket).await?;
        tracing::info!(org = %org.name, bucket = %bucket.name, "Connected to time-series backend");

        let engine = Self {
            builder: QueryBuilder::new(&bucket.name, &org.name)?,
            backend,
            catalog,
            settings,
            org_id: org.id,
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        if let Err(e) = engine.reconcile_tasks().await {
            tracing::error!("Could not reconcile aggregation tasks: {}", e);
        }
        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn catalog(&self) -> Arc<MetricCatalog> {
        self.catalog.snapshot()
    }

    /// Metric series of `job`, restricted to `nodes` unless empty.
    ///
    /// Finished jobs also get quantile series. A failing metric is logged
    /// and left out; the call fails only if every metric failed.
    pub async fn get_job_data(
        &self,
        job: &Job,
        nodes: &[String],
        interval: Duration,
        raw: bool,
    ) -> Result<JobData, EngineError> {
        self.job_data(job, nodes, interval, raw, false).await
    }

    /// Like [`Self::get_job_data`] over all nodes, with every device-level
    /// metric read from its aggregated measurement.
    pub async fn get_aggregated_job_data(
        &self,
        job: &Job,
        interval: Duration,
    ) -> Result<JobData, EngineError> {
        self.job_data(job, &[], interval, false, true).await
    }

    async fn job_data(
        &self,
        job: &Job,
        nodes: &[String],
        interval: Duration,
        raw: bool,
        force_aggregate: bool,
    ) -> Result<JobData, EngineError> {
        let now = Utc::now().timestamp();
        let metrics = self.catalog.snapshot().metrics_for(job);
        let scope = Scope::for_job(job, nodes, interval, self.settings.default_interval, now);
        let with_quantiles = !job.is_running && !self.settings.quantiles.is_empty();

        let mut metric_plans = Vec::with_capacity(metrics.len());
        let mut quantile_plans = Vec::new();
        for metric in &metrics {
            match plan::metric_plan(&self.builder, metric, &scope, raw, force_aggregate) {
                Ok(p) => metric_plans.push(p),
                Err(e) => tracing::error!(job_id = job.id, metric = %metric.guid, "Could not plan query: {}", e),
            }
            if with_quantiles {
                match plan::quantile_plan(&self.builder, metric, &scope, &self.settings.quantiles) {
                    Ok(p) => quantile_plans.push(p),
                    Err(e) => tracing::error!(job_id = job.id, metric = %metric.guid, "Could not plan quantile query: {}", e),
                }
            }
        }

        let metric_jobs = metric_plans
            .into_iter()
            .map(|p| (p.metric.guid.clone(), run_metric(Arc::clone(&self.backend), p)))
            .collect();
        let quantile_jobs = quantile_plans
            .into_iter()
            .map(|p| (p.metric.guid.clone(), run_quantile(Arc::clone(&self.backend), p)))
            .collect();
        let (metric_data, quantile_data) = tokio::join!(
            fan_out(job.id, metric_jobs),
            fan_out(job.id, quantile_jobs)
        );
        let metric_data: Vec<MetricData> = metric_data.into_iter().flatten().collect();
        if !metrics.is_empty() && metric_data.is_empty() {
            return Err(EngineError::NoData(job.id));
        }

        let (sample_intervals, _) = job.sample_intervals(self.settings.default_interval, now);
        Ok(JobData {
            metadata: job.clone(),
            metric_data,
            quantile_data: quantile_data.into_iter().flatten().collect(),
            sample_interval: scope.every.as_secs_f64(),
            sample_intervals,
        })
    }

    /// One metric of `job` under an explicit aggregation function.
    pub async fn get_metric_data_with_agg_fn(
        &self,
        job: &Job,
        guid: &str,
        agg_fn: &str,
        interval: Duration,
    ) -> Result<MetricData, EngineError> {
        let agg_fn = AggFn::new(agg_fn)?;
        let metric = self
            .catalog
            .snapshot()
            .metric(guid)
            .cloned()
            .ok_or_else(|| EngineError::UnknownMetric(guid.to_string()))?;
        let scope = Scope::for_job(
            job,
            &[],
            interval,
            self.settings.default_interval,
            Utc::now().timestamp(),
        );
        let plan = plan::agg_fn_plan(&self.builder, &metric, &agg_fn, &scope)?;
        Ok(run_metric(Arc::clone(&self.backend), plan).await?)
    }

    /// Per-metric mean, max and change points of a finished job.
    pub async fn get_job_metadata_metrics(&self, job: &Job) -> Result<Vec<MetricSummary>, EngineError> {
        if job.is_running {
            return Err(EngineError::JobRunning(job.id));
        }
        if job.stop_time <= job.start_time {
            return Err(EngineError::InvalidTimeRange {
                id: job.id,
                start: job.start_time,
                stop: job.stop_time,
            });
        }

        let now = Utc::now().timestamp();
        let (_, best) = job.sample_intervals(self.settings.default_interval, now);
        let metrics = self.catalog.snapshot().metrics_for(job);
        let scope = Scope::for_job(job, &[], best, self.settings.default_interval, now);

        let summary_jobs = metrics
            .iter()
            .filter_map(|metric| match plan::summary_plan(&self.builder, metric, &scope) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::error!(job_id = job.id, metric = %metric.guid, "Could not plan summary query: {}", e);
                    None
                }
            })
            .map(|p| (p.metric.guid.clone(), run_summary(Arc::clone(&self.backend), p)))
            .collect();
        let mut summaries: Vec<MetricSummary> =
            fan_out(job.id, summary_jobs).await.into_iter().flatten().collect();

        match self.get_aggregated_job_data(job, best).await {
            Ok(data) => {
                let change_points = detect_change_points(&data);
                for summary in &mut summaries {
                    if let Some(times) = change_points.get(&summary.config.measurement) {
                        summary.change_points = times.clone();
                    }
                }
            }
            Err(e) => tracing::error!(job_id = job.id, "Could not detect change points: {}", e),
        }

        tracing::debug!(job_id = job.id, metrics = summaries.len(), "Computed metric summaries");
        Ok(summaries)
    }

    /// Trigger a manual run of every registered aggregation task without
    /// waiting for completion.
    pub async fn run_aggregation(&self) {
        let tasks = self.tasks.lock().await.clone();
        for task in tasks {
            let backend = Arc::clone(&self.backend);
            tokio::spawn(async move {
                if let Err(e) = backend.run_task(&task).await {
                    tracing::error!(task = %task.name, "Could not run aggregation task: {}", e);
                }
            });
        }
    }

    /// Swap in a new catalog and create the tasks its metrics need.
    pub async fn reload_catalog(&self, catalog: MetricCatalog) -> Result<usize, EngineError> {
        self.catalog.replace(catalog);
        self.reconcile_tasks().await
    }
}

pub(crate) async fn run_metric(backend: Arc<dyn FluxBackend>, plan: MetricPlan) -> Result<MetricData, FluxError> {
    match plan.output {
        Output::Raw => {
            let raw = backend.query_raw(&plan.query).await?;
            Ok(MetricData::raw(plan.metric, raw))
        }
        Output::Series { key } => {
            let records = backend.query(&plan.query).await?;
            Ok(MetricData::parsed(plan.metric, group_by_key(records, &key)?))
        }
    }
}

async fn run_quantile(backend: Arc<dyn FluxBackend>, plan: QuantilePlan) -> Result<QuantileData, FluxError> {
    let records = backend.query(&plan.query).await?;
    Ok(QuantileData {
        config: plan.metric,
        quantiles: plan.quantiles,
        data: group_by_key(records, "_field")?,
    })
}

async fn run_summary(backend: Arc<dyn FluxBackend>, plan: SummaryPlan) -> Result<MetricSummary, FluxError> {
    let records = backend.query(&plan.query).await?;
    Ok(plan::summary_from_records(plan.metric, &records))
}

/// Run every future on its own task and collect the results by position.
///
/// Failed entries are logged under their label and left as `None`.
pub(crate) async fn fan_out<T, F>(job_id: i64, pending: Vec<(String, F)>) -> Vec<Option<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T, FluxError>> + Send + 'static,
{
    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(pending.len()).collect();
    let mut set = JoinSet::new();
    for (idx, (label, fut)) in pending.into_iter().enumerate() {
        set.spawn(async move { (idx, label, fut.await) });
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, _, Ok(value))) => slots[idx] = Some(value),
            Ok((_, label, Err(e))) => {
                tracing::error!(job_id, metric = %label, "Query failed: {}", e);
            }
            Err(e) => tracing::error!(job_id, "Query task aborted: {}", e),
        }
    }
    slots
}
