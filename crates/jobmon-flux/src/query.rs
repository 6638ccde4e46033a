//! Flux query templates.
//!
//! Every template is rendered from validated parts only, so identical
//! parameters always produce identical query strings.

use crate::error::FluxError;
use crate::expr::{AggFn, Clause, Ident, NodeFilter, string_literal};
use jobmon_core::config::MAX_QUANTILES;
use jobmon_core::{MetricConfig, format_flux_duration};
use std::time::Duration;

/// Column the aggregated series are keyed by.
pub const HOSTNAME: &str = "hostname";

/// Interval at which aggregation tasks run.
pub const TASK_EVERY: &str = "1m";

/// Metrics computed at query time as the sum of several raw measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synthesized {
    /// File system reads plus writes
    IOps,
    /// File system opens, closes, inode updates and directory reads
    MetaOps,
}

impl Synthesized {
    /// Synthesized metric selected by a metric's unit.
    pub fn from_unit(unit: &str) -> Option<Self> {
        match unit {
            "IOps" => Some(Self::IOps),
            "MetaOps" => Some(Self::MetaOps),
            _ => None,
        }
    }

    /// Raw measurements summed into the metric.
    pub fn components(self) -> &'static [&'static str] {
        match self {
            Self::IOps => &["gpfs_num_reads", "gpfs_num_writes"],
            Self::MetaOps => &[
                "gpfs_num_closes",
                "gpfs_num_opens",
                "gpfs_num_inode_updates",
                "gpfs_num_readdirs",
            ],
        }
    }
}

/// Parameters of a per-job measurement query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementQuery {
    pub measurement: Ident,
    /// Device type the raw measurement is filtered on
    pub kind: Ident,
    /// Epoch seconds
    pub start: i64,
    /// Epoch seconds
    pub stop: i64,
    pub nodes: NodeFilter,
    pub every: Duration,
    pub filter: Clause,
    pub post: Clause,
    pub synthesized: Option<Synthesized>,
}

impl MeasurementQuery {
    pub fn for_metric(
        metric: &MetricConfig,
        start: i64,
        stop: i64,
        nodes: NodeFilter,
        every: Duration,
    ) -> Result<Self, FluxError> {
        Ok(Self {
            measurement: Ident::new(&metric.measurement)?,
            kind: Ident::new(&metric.kind)?,
            start,
            stop,
            nodes,
            every,
            filter: Clause::new(&metric.filter_func)?,
            post: Clause::new(&metric.post_query_op)?,
            synthesized: Synthesized::from_unit(&metric.unit),
        })
    }

    /// Target the measurement written by the `agg_fn` aggregation task.
    ///
    /// Synthesized metrics have no aggregation task and keep reading their
    /// raw components.
    pub fn aggregated(mut self, agg_fn: &AggFn) -> Self {
        if self.synthesized.is_none() {
            self.measurement = self.measurement.suffixed(agg_fn);
        }
        self
    }

    /// Drop the filter clause, which no longer applies to aggregated data.
    pub fn without_filter(mut self) -> Self {
        self.filter = Clause::default();
        self
    }

    pub fn with_post(mut self, extra: &Clause) -> Self {
        self.post = self.post.then(extra);
        self
    }

    fn clauses(&self) -> String {
        render_clauses(&self.filter, &self.post)
    }

    /// Filter line selecting the measurement, or every component of a
    /// synthesized metric.
    fn measurement_filter(&self) -> String {
        let predicate = match self.synthesized {
            None => format!("r[\"_measurement\"] == {}", string_literal(self.measurement.as_str())),
            Some(synthesized) => synthesized
                .components()
                .iter()
                .map(|c| format!("r[\"_measurement\"] == {}", string_literal(c)))
                .collect::<Vec<_>>()
                .join(" or "),
        };
        format!("\t|> filter(fn: (r) => {predicate})\n")
    }

    /// Pivot and sum the components of a synthesized metric into `_value`.
    fn combine(&self) -> String {
        let Some(synthesized) = self.synthesized else {
            return String::new();
        };
        let sum = synthesized
            .components()
            .iter()
            .map(|c| format!("r[{}]", string_literal(c)))
            .collect::<Vec<_>>()
            .join(" + ");
        format!(
            "\t|> pivot(rowKey: [\"_time\"], columnKey: [\"_measurement\"], valueColumn: \"_value\")\n\
             \t|> map(fn: (r) => ({{r with _value: {sum}}}))\n"
        )
    }
}

fn render_clauses(filter: &Clause, post: &Clause) -> String {
    [filter, post]
        .into_iter()
        .filter(|c| !c.is_empty())
        .map(|c| format!("\t{}\n", c.as_str()))
        .collect()
}

/// Renders queries against one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuilder {
    bucket: Ident,
    org: String,
}

impl QueryBuilder {
    pub fn new(bucket: &str, org: &str) -> Result<Self, FluxError> {
        Ok(Self {
            bucket: Ident::new(bucket)?,
            org: org.to_string(),
        })
    }

    /// Per-device series of a raw or synthesized measurement.
    pub fn simple_measurement(&self, q: &MeasurementQuery) -> String {
        let every = format_flux_duration(q.every);
        format!(
            "from(bucket: {bucket})\n\
             \t|> range(start: {start}, stop: {stop})\n\
             {measurement_filter}\
             \t|> filter(fn: (r) => r[\"type\"] == {kind})\n\
             \t|> filter(fn: (r) => r[\"hostname\"] =~ /{nodes}/)\n\
             {combine}\
             \t|> aggregateWindow(every: {every}, fn: mean, createEmpty: true)\n\
             {clauses}\
             \t|> truncateTimeColumn(unit: {every})\n",
            bucket = string_literal(self.bucket.as_str()),
            start = q.start,
            stop = q.stop,
            measurement_filter = q.measurement_filter(),
            combine = q.combine(),
            kind = string_literal(q.kind.as_str()),
            nodes = q.nodes.as_str(),
            clauses = q.clauses(),
        )
    }

    /// Node-level series of a measurement, without a type filter.
    pub fn aggregate_measurement(&self, q: &MeasurementQuery) -> String {
        let every = format_flux_duration(q.every);
        format!(
            "from(bucket: {bucket})\n\
             \t|> range(start: {start}, stop: {stop})\n\
             {measurement_filter}\
             \t|> filter(fn: (r) => r[\"hostname\"] =~ /{nodes}/)\n\
             {combine}\
             \t|> aggregateWindow(every: {every}, fn: mean, createEmpty: true)\n\
             {clauses}\
             \t|> truncateTimeColumn(unit: {every})\n",
            bucket = string_literal(self.bucket.as_str()),
            start = q.start,
            stop = q.stop,
            measurement_filter = q.measurement_filter(),
            combine = q.combine(),
            nodes = q.nodes.as_str(),
            clauses = q.clauses(),
        )
    }

    /// Quantiles across all nodes per time bucket, one series per quantile.
    pub fn quantile_measurement(
        &self,
        q: &MeasurementQuery,
        quantiles: &[String],
    ) -> Result<String, FluxError> {
        if quantiles.is_empty() {
            return Err(FluxError::InvalidQuantile(String::new()));
        }
        if quantiles.len() > MAX_QUANTILES {
            return Err(FluxError::TooManyQuantiles(quantiles.len()));
        }

        let every = format_flux_duration(q.every);
        let quant_measurement = string_literal(&format!("{}_quant", q.measurement));

        let mut streams = Vec::with_capacity(quantiles.len());
        let mut sub_queries = String::new();
        for (name, quantile) in ('A'..='Z').zip(quantiles) {
            match quantile.parse::<f64>() {
                Ok(v) if (0.0..=1.0).contains(&v) => {}
                _ => return Err(FluxError::InvalidQuantile(quantile.clone())),
            }
            sub_queries.push_str(&format!(
                "{name} = data\n\
                 \t|> quantile(column: \"_value\", q: {quantile}, method: \"estimate_tdigest\", compression: 1000.0)\n\
                 \t|> set(key: \"_field\", value: {field})\n\
                 \t|> set(key: \"_measurement\", value: {quant_measurement})\n\n",
                field = string_literal(quantile),
            ));
            streams.push(name.to_string());
        }

        Ok(format!(
            "data = from(bucket: {bucket})\n\
             \t|> range(start: {start}, stop: {stop})\n\
             {measurement_filter}\
             \t|> filter(fn: (r) => r[\"hostname\"] =~ /{nodes}/)\n\
             {combine}\
             \t|> aggregateWindow(every: {every}, fn: mean, createEmpty: true)\n\
             {clauses}\
             \t|> truncateTimeColumn(unit: {every})\n\
             \t|> group(columns: [\"_time\"], mode: \"by\")\n\n\
             {sub_queries}\
             union(tables: [{streams}])\n\
             \t|> group(columns: [\"_field\"])\n",
            bucket = string_literal(self.bucket.as_str()),
            start = q.start,
            stop = q.stop,
            measurement_filter = q.measurement_filter(),
            nodes = q.nodes.as_str(),
            combine = q.combine(),
            clauses = q.clauses(),
            streams = streams.join(","),
        ))
    }

    /// Job-wide mean and the median of the five largest values per time.
    pub fn metadata_measurement(&self, q: &MeasurementQuery) -> String {
        format!(
            "data = from(bucket: {bucket})\n\
             \t|> range(start: {start}, stop: {stop})\n\
             {measurement_filter}\
             \t|> filter(fn: (r) => r[\"hostname\"] =~ /{nodes}/)\n\
             {combine}\
             {clauses}\n\
             mean = data\n\
             \t|> mean(column: \"_value\")\n\
             \t|> group()\n\
             \t|> mean(column: \"_value\")\n\
             \t|> set(key: \"_field\", value: \"mean\")\n\n\
             max = data\n\
             \t|> highestMax(n: 5, groupColumns: [\"_time\"])\n\
             \t|> median()\n\
             \t|> set(key: \"_field\", value: \"max\")\n\n\
             union(tables: [mean, max])\n",
            bucket = string_literal(self.bucket.as_str()),
            start = q.start,
            stop = q.stop,
            measurement_filter = q.measurement_filter(),
            combine = q.combine(),
            nodes = q.nodes.as_str(),
            clauses = q.clauses(),
        )
    }

    /// Name of the task that writes `<measurement>_<agg_fn>`.
    pub fn task_name(&self, measurement: &Ident, agg_fn: &AggFn) -> String {
        format!("{}_{}_{}", self.bucket, measurement, agg_fn)
    }

    /// Scheduled task aggregating per-device series of `metric` to node level.
    ///
    /// Returns the task name and its Flux body (without the task option).
    pub fn aggregation_task(
        &self,
        metric: &MetricConfig,
        agg_fn: &AggFn,
        every: Duration,
    ) -> Result<(String, String), FluxError> {
        let measurement = Ident::new(&metric.measurement)?;
        let kind = Ident::new(&metric.kind)?;
        let filter = Clause::new(&metric.filter_func)?;
        let post = Clause::new(&metric.post_query_op)?;
        let target = string_literal(measurement.suffixed(agg_fn).as_str());

        let flux = format!(
            "from(bucket: {bucket})\n\
             \t|> range(start: -task.every)\n\
             \t|> filter(fn: (r) => r[\"_measurement\"] == {measurement})\n\
             \t|> filter(fn: (r) => r.type == {kind})\n\
             {clauses}\
             \t|> group(columns: [\"_measurement\", \"hostname\"], mode: \"by\")\n\
             \t|> aggregateWindow(every: {every}, fn: {agg_fn}, createEmpty: false)\n\
             \t|> group(columns: [\"hostname\"], mode: \"by\")\n\
             \t|> keep(columns: [\"hostname\", \"_start\", \"_stop\", \"_time\", \"_value\", \"cluster\"])\n\
             \t|> set(key: \"_measurement\", value: {target})\n\
             \t|> set(key: \"_field\", value: {target})\n\
             \t|> to(bucket: {bucket}, org: {org})\n",
            bucket = string_literal(self.bucket.as_str()),
            measurement = string_literal(measurement.as_str()),
            kind = string_literal(kind.as_str()),
            clauses = render_clauses(&filter, &post),
            every = format_flux_duration(every),
            org = string_literal(&self.org),
        );
        Ok((self.task_name(&measurement, agg_fn), flux))
    }
}

/// Full task script: the `option task` header followed by `flux`.
pub fn task_definition(name: &str, every: &str, flux: &str) -> String {
    format!(
        "option task = {{name: {}, every: {}}}\n\n{}",
        string_literal(name),
        every,
        flux
    )
}
