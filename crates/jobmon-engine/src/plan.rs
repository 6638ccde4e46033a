//! Query planning: which template each metric of a request is rendered
//! with, and how its records are keyed.
//!
//! Planning is pure so the dispatch rules can be tested without a backend.

use jobmon_core::{Job, MetricConfig, MetricSummary, QueryResult};
use jobmon_flux::query::HOSTNAME;
use jobmon_flux::{AggFn, Clause, FluxError, MeasurementQuery, NodeFilter, QueryBuilder};
use std::time::Duration;

/// Time window and node selection shared by all queries of one request.
#[derive(Debug, Clone)]
pub struct Scope {
    /// Epoch seconds
    pub start: i64,
    /// Epoch seconds
    pub stop: i64,
    pub every: Duration,
    /// Nodes the per-metric series are restricted to
    pub nodes: Vec<String>,
    /// All nodes of the job, used by job-wide queries
    pub job_nodes: Vec<String>,
    /// Appended to every query's post-processing clause
    pub post: Clause,
}

impl Scope {
    /// Scope over `job`, restricted to `nodes` unless empty.
    ///
    /// Running jobs are measured up to `now`. A zero `every` falls back to
    /// `default_every`.
    pub fn for_job(job: &Job, nodes: &[String], every: Duration, default_every: Duration, now: i64) -> Self {
        let job_nodes: Vec<String> = job.nodes().map(str::to_string).collect();
        let nodes = if nodes.is_empty() {
            job_nodes.clone()
        } else {
            nodes.to_vec()
        };
        Self {
            start: job.start_time,
            stop: if job.is_running { now } else { job.stop_time },
            every: if every.is_zero() { default_every } else { every },
            nodes,
            job_nodes,
            post: Clause::default(),
        }
    }

    pub fn with_post(mut self, post: Clause) -> Self {
        self.post = post;
        self
    }

    fn query(&self, metric: &MetricConfig, nodes: &[String]) -> Result<MeasurementQuery, FluxError> {
        let filter = NodeFilter::new(nodes.iter().map(String::as_str))?;
        Ok(
            MeasurementQuery::for_metric(metric, self.start, self.stop, filter, self.every)?
                .with_post(&self.post),
        )
    }
}

/// How the answer to a metric query is turned into [`jobmon_core::MetricData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Parse and group records by this column
    Series { key: String },
    /// Pass the annotated CSV through
    Raw,
}

#[derive(Debug, Clone)]
pub struct MetricPlan {
    pub metric: MetricConfig,
    pub query: String,
    pub output: Output,
}

#[derive(Debug, Clone)]
pub struct QuantilePlan {
    pub metric: MetricConfig,
    pub query: String,
    pub quantiles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SummaryPlan {
    pub metric: MetricConfig,
    pub query: String,
}

/// Column per-device series of `metric` are split by.
pub fn separation_key(metric: &MetricConfig) -> &str {
    if metric.separation_key.is_empty() {
        HOSTNAME
    } else {
        &metric.separation_key
    }
}

/// Plan the series query of one metric.
///
/// A single selected node yields per-device series keyed by the metric's
/// separation key, unless `force_aggregate` is set. Otherwise device-level
/// metrics read the measurement written by their aggregation task and
/// node-level metrics read the base measurement, both keyed by hostname.
pub fn metric_plan(
    builder: &QueryBuilder,
    metric: &MetricConfig,
    scope: &Scope,
    raw: bool,
    force_aggregate: bool,
) -> Result<MetricPlan, FluxError> {
    let q = scope.query(metric, &scope.nodes)?;
    let aggregate = force_aggregate || scope.nodes.len() > 1;

    if raw {
        let query = if force_aggregate && !metric.is_node_level() {
            builder.aggregate_measurement(&q.aggregated(&AggFn::new(&metric.agg_fn)?))
        } else {
            builder.simple_measurement(&q)
        };
        return Ok(MetricPlan {
            metric: metric.clone(),
            query,
            output: Output::Raw,
        });
    }

    let (query, key) = if !aggregate {
        (builder.simple_measurement(&q), separation_key(metric))
    } else if metric.is_node_level() {
        (builder.simple_measurement(&q), HOSTNAME)
    } else {
        let q = q.aggregated(&AggFn::new(&metric.agg_fn)?);
        (builder.aggregate_measurement(&q), HOSTNAME)
    };
    Ok(MetricPlan {
        metric: metric.clone(),
        query,
        output: Output::Series {
            key: key.to_string(),
        },
    })
}

/// Plan the series of one metric under an explicit aggregation function,
/// across all of the job's nodes.
pub fn agg_fn_plan(
    builder: &QueryBuilder,
    metric: &MetricConfig,
    agg_fn: &AggFn,
    scope: &Scope,
) -> Result<MetricPlan, FluxError> {
    let q = scope.query(metric, &scope.job_nodes)?.aggregated(agg_fn);
    let mut metric = metric.clone();
    metric.agg_fn = agg_fn.as_str().to_string();
    Ok(MetricPlan {
        metric,
        query: builder.aggregate_measurement(&q),
        output: Output::Series {
            key: HOSTNAME.to_string(),
        },
    })
}

/// Plan the quantile query of one metric over all of the job's nodes.
pub fn quantile_plan(
    builder: &QueryBuilder,
    metric: &MetricConfig,
    scope: &Scope,
    quantiles: &[String],
) -> Result<QuantilePlan, FluxError> {
    let q = scope
        .query(metric, &scope.job_nodes)?
        .aggregated(&AggFn::new(&metric.agg_fn)?)
        .without_filter();
    Ok(QuantilePlan {
        metric: metric.clone(),
        query: builder.quantile_measurement(&q, quantiles)?,
        quantiles: quantiles.to_vec(),
    })
}

/// Plan the mean/max summary query of one metric over the whole job.
pub fn summary_plan(
    builder: &QueryBuilder,
    metric: &MetricConfig,
    scope: &Scope,
) -> Result<SummaryPlan, FluxError> {
    let q = scope
        .query(metric, &scope.job_nodes)?
        .aggregated(&AggFn::new(&metric.agg_fn)?)
        .without_filter();
    Ok(SummaryPlan {
        metric: metric.clone(),
        query: builder.metadata_measurement(&q),
    })
}

/// Build a summary from the records of a metadata query.
///
/// Rows are picked by their `_field` (`mean`, `max`) and fall back to
/// position. Missing rows yield zeros.
pub fn summary_from_records(metric: MetricConfig, records: &[QueryResult]) -> MetricSummary {
    let value = |field: &str, position: usize| {
        records
            .iter()
            .find(|r| r.get("_field").and_then(|f| f.as_str()) == Some(field))
            .or_else(|| records.get(position))
            .and_then(|r| r.get("_value"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    };
    MetricSummary {
        mean: value("mean", 0),
        max: value("max", 1),
        config: metric,
        change_points: Vec::new(),
    }
}
