//! Application context: one instance of each component and the flows
//! that span them.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use jobmon_cache::{CacheError, ResultCache};
use jobmon_core::{
    CatalogHandle, ConfigError, Configuration, ErrorKind, Job, JobData, MetricCatalog, MetricData,
    StopJob, Tag,
};
use jobmon_engine::{EngineError, EngineSettings, LiveSession, MetricsSource, TimeSeriesEngine};
use jobmon_flux::{FluxError, InfluxClient};
use jobmon_store::{JanitorReport, JobLifecycle, JobStore, StoreError, open_store};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Window served for running jobs, in seconds.
const RUNNING_WINDOW: i64 = 3600;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Node {node} does not belong to job {id}")]
    NodeNotInJob { id: i64, node: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Flux(#[from] FluxError),
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NodeNotInJob { .. } | Self::Config(_) => ErrorKind::Validation,
            Self::Store(e) => e.kind(),
            Self::Engine(e) => e.kind(),
            Self::Cache(e) => e.kind(),
            Self::Flux(e) => e.kind(),
        }
    }
}

/// Options of a job data read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRequest {
    /// Restrict to these nodes; empty means all of the job's nodes
    pub nodes: Vec<String>,
    /// Explicit sample interval instead of the job's best one
    pub interval: Option<Duration>,
    /// Return the backend's CSV unparsed
    pub raw: bool,
}

impl DataRequest {
    /// Only the default view of a finished job is served from the cache.
    fn cacheable(&self, job: &Job) -> bool {
        self.nodes.is_empty() && self.interval.is_none() && !self.raw && !job.is_running
    }
}

pub struct AppContext {
    config_path: Utf8PathBuf,
    engine: TimeSeriesEngine,
    catalog: CatalogHandle,
    store: Arc<dyn JobStore>,
    lifecycle: JobLifecycle,
    cache: ResultCache,
    prefetch: bool,
}

impl AppContext {
    pub fn new(
        config_path: Utf8PathBuf,
        config: &Configuration,
        engine: TimeSeriesEngine,
        catalog: CatalogHandle,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let source: Arc<dyn MetricsSource> = Arc::new(engine.clone());
        let lifecycle = JobLifecycle::new(
            Arc::clone(&store),
            Arc::clone(&source),
            catalog.clone(),
            config.default_ttl,
        );
        Self {
            config_path,
            engine,
            catalog,
            store,
            lifecycle,
            cache: ResultCache::new(source, config.cache_size),
            prefetch: config.prefetch,
        }
    }

    /// Load the configuration, connect to the backend and open the store.
    pub async fn init(config_path: &Utf8Path) -> Result<Self, ContextError> {
        let config = Configuration::load(config_path)?;
        config.require_backend()?;

        let client = InfluxClient::new(
            &config.db.host,
            &config.db.token,
            &config.db.org,
            config.query_timeout(),
        )?;
        let catalog = CatalogHandle::new(MetricCatalog::from_config(&config));
        let engine = TimeSeriesEngine::connect(
            Arc::new(client),
            catalog.clone(),
            EngineSettings::from_config(&config),
        )
        .await?;
        let store = open_store(&config.job_store).await?;

        tracing::info!(
            cache_size = config.cache_size,
            prefetch = config.prefetch,
            "Application context ready"
        );
        Ok(Self::new(config_path.to_owned(), &config, engine, catalog, store))
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn engine(&self) -> &TimeSeriesEngine {
        &self.engine
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }

    fn default_interval(&self) -> Duration {
        self.engine.settings().default_interval
    }

    pub async fn start_job(&self, job: Job) -> Result<Job, ContextError> {
        Ok(self.lifecycle.start_job(job).await?)
    }

    /// Stop a job, trigger the aggregation tasks and, if enabled, warm the
    /// cache with the job's default view.
    pub async fn stop_job(&self, id: i64, stop: StopJob) -> Result<Job, ContextError> {
        let job = self.lifecycle.stop_job(id, stop).await?;
        self.engine.run_aggregation().await;

        if self.prefetch {
            let (_, best) = job.sample_intervals(self.default_interval(), Utc::now().timestamp());
            if let Err(e) = self.cache.get(&job, best).await {
                tracing::warn!(job = id, "Could not prefetch job data: {}", e);
            }
        }
        Ok(job)
    }

    /// Job data as served to clients.
    ///
    /// Running jobs are read over the last hour across all nodes and never
    /// cached. Nodes outside the job are rejected.
    pub async fn job_data(&self, id: i64, request: &DataRequest) -> Result<JobData, ContextError> {
        let job = self.store.get_job(id).await?;
        if let Some(node) = request.nodes.iter().find(|n| !job.has_node(n)) {
            return Err(ContextError::NodeNotInJob {
                id,
                node: node.clone(),
            });
        }

        let now = Utc::now().timestamp();
        let (intervals, best) = job.sample_intervals(self.default_interval(), now);
        let interval = request.interval.unwrap_or(best);

        let mut data = if request.cacheable(&job) {
            self.cache.get(&job, interval).await?
        } else if job.is_running {
            let window = running_window(&job, now);
            self.engine
                .get_job_data(&window, &[], interval, request.raw)
                .await?
        } else {
            self.engine
                .get_job_data(&job, &request.nodes, interval, request.raw)
                .await?
        };

        data.metadata = job;
        data.sample_interval = interval.as_secs_f64();
        data.sample_intervals = intervals;
        Ok(data)
    }

    /// One metric of a job under an explicit aggregation function.
    pub async fn metric_with_agg_fn(
        &self,
        id: i64,
        guid: &str,
        agg_fn: &str,
        interval: Option<Duration>,
    ) -> Result<MetricData, ContextError> {
        let job = self.store.get_job(id).await?;
        let now = Utc::now().timestamp();
        let (_, best) = job.sample_intervals(self.default_interval(), now);
        let job = if job.is_running {
            running_window(&job, now)
        } else {
            job
        };
        Ok(self
            .engine
            .get_metric_data_with_agg_fn(&job, guid, agg_fn, interval.unwrap_or(best))
            .await?)
    }

    pub async fn live(&self, id: i64) -> Result<LiveSession, ContextError> {
        let job = self.store.get_job(id).await?;
        Ok(self.engine.live_channel(&job))
    }

    pub async fn add_tag(&self, id: i64, tag: Tag) -> Result<Tag, ContextError> {
        let tag = self.store.add_tag(id, tag).await?;
        self.refresh_cached(id).await?;
        Ok(tag)
    }

    pub async fn remove_tag(&self, id: i64, tag_id: i64) -> Result<(), ContextError> {
        self.store.remove_tag(id, tag_id).await?;
        self.refresh_cached(id).await
    }

    pub async fn refresh_metadata(&self, id: i64) -> Result<Job, ContextError> {
        let job = self.lifecycle.refresh_metadata(id).await?;
        self.cache.update_job(&job).await;
        Ok(job)
    }

    async fn refresh_cached(&self, id: i64) -> Result<(), ContextError> {
        let job = self.store.get_job(id).await?;
        self.cache.update_job(&job).await;
        Ok(())
    }

    /// Re-read the configuration file, swap the metric catalog and create
    /// the aggregation tasks it needs. An invalid file leaves the running
    /// configuration in place.
    pub async fn reload_config(&self) -> Result<usize, ContextError> {
        let (config, deleted) =
            Configuration::reload(&self.config_path, &self.catalog.snapshot())?;
        if !deleted.is_empty() {
            tracing::warn!(metrics = ?deleted, "Metrics removed from configuration");
        }
        let created = self
            .engine
            .reload_catalog(MetricCatalog::from_config(&config))
            .await?;
        tracing::info!(
            metrics = self.catalog.snapshot().metrics().count(),
            created,
            "Reloaded configuration"
        );
        Ok(created)
    }

    /// Run both janitors and drop reaped jobs from the cache.
    pub async fn run_janitors(&self, now: i64) -> JanitorReport {
        let report = self.lifecycle.run_janitors(now).await;
        for id in &report.reaped {
            self.cache.invalidate(*id).await;
        }
        report
    }

    /// Attach summaries to stopped jobs that have none.
    pub async fn enrich_missing(&self) -> Result<usize, ContextError> {
        Ok(self.lifecycle.enrich_missing().await?)
    }

    pub async fn flush(&self) -> Result<(), ContextError> {
        Ok(self.store.flush().await?)
    }
}

/// `job` narrowed to the last hour up to `now`.
fn running_window(job: &Job, now: i64) -> Job {
    Job {
        start_time: job.start_time.max(now - RUNNING_WINDOW),
        stop_time: now,
        ..job.clone()
    }
}
