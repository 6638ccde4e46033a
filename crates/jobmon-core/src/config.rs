//! Configuration file model and validation.
//!
//! The file is JSON with PascalCase keys. Keys this crate does not know about
//! (authentication, frontend and notification settings) are ignored.

use crate::catalog::MetricCatalog;
use crate::duration::parse_duration;
use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Aggregation functions supported by the time-series backend.
pub const ALLOWED_AGG_FNS: [&str; 4] = ["max", "mean", "min", "sum"];

/// Upper bound on quantiles, one named stream per letter.
pub const MAX_QUANTILES: usize = 26;

/// Source and sink calls that must not appear in an injected clause.
static FORBIDDEN_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(from|to|buckets|yield)\s*\(|(^|\s)(import|option)\s").expect("valid regex")
});

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Metric {metric} uses unknown aggregation function {agg_fn:?}")]
    UnknownAggFn { metric: String, agg_fn: String },

    #[error("Metric {metric} from partition {partition} is not configured")]
    UnknownMetric { partition: String, metric: String },

    #[error("Metric GUID {0} is configured more than once")]
    DuplicateMetric(String),

    #[error("Invalid duration {value:?} for {field}")]
    InvalidDuration { field: String, value: String },

    #[error("Invalid quantile {0:?}, expected a decimal in [0, 1]")]
    InvalidQuantile(String),

    #[error("At most {MAX_QUANTILES} quantiles are supported, got {0}")]
    TooManyQuantiles(usize),

    #[error("Metric {metric}: invalid {field} clause {clause:?}")]
    InvalidClause {
        metric: String,
        field: &'static str,
        clause: String,
    },
}

/// Connection settings for the time-series backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    /// Base URL, e.g. http://influxdb.example.org:8086
    #[serde(rename = "DBHost", default)]
    pub host: String,
    #[serde(rename = "DBToken", default)]
    pub token: String,
    #[serde(rename = "DBOrg", default)]
    pub org: String,
    #[serde(rename = "DBBucket", default)]
    pub bucket: String,
}

/// Which job store backs the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type", rename_all = "lowercase")]
pub enum JobStoreConfig {
    /// In-process map, optionally persisted to a JSON file on flush
    Memory {
        #[serde(rename = "StoreFile", default)]
        store_file: Option<Utf8PathBuf>,
    },
    /// SQLite database through sqlx
    Sqlite {
        #[serde(rename = "Path")]
        path: String,
    },
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self::Memory { store_file: None }
    }
}

/// A metric as configured by the administrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MetricConfig {
    #[serde(rename = "GUID")]
    pub guid: String,
    /// "node", "cpu", "socket", "accelerator", ...
    #[serde(rename = "Type")]
    pub kind: String,
    pub categories: Vec<String>,
    /// Measurement name in the bucket
    pub measurement: String,
    /// Default aggregation of per-device series to node level
    pub agg_fn: String,
    pub available_agg_fns: Vec<String>,
    /// Collector sample interval, e.g. "30s"; empty uses the global default
    pub sample_interval: String,
    pub unit: String,
    pub display_name: String,
    /// Flux clause applied after the node filter
    pub filter_func: String,
    /// Flux clause applied before the query is terminated
    pub post_query_op: String,
    /// Tag used to split per-device series
    pub separation_key: String,
    pub max_per_node: i64,
    pub max_per_type: i64,
}

impl MetricConfig {
    /// Node-level metrics have no per-device series to aggregate.
    pub fn is_node_level(&self) -> bool {
        self.kind == "node"
    }

    /// The metric's own sample interval, or `default` if unset or invalid.
    pub fn interval_or(&self, default: Duration) -> Duration {
        parse_duration(&self.sample_interval).unwrap_or(default)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fns = std::iter::once(&self.agg_fn).chain(&self.available_agg_fns);
        for agg_fn in fns {
            if !ALLOWED_AGG_FNS.contains(&agg_fn.as_str()) {
                return Err(ConfigError::UnknownAggFn {
                    metric: self.guid.clone(),
                    agg_fn: agg_fn.clone(),
                });
            }
        }
        if !self.sample_interval.is_empty() && parse_duration(&self.sample_interval).is_none() {
            return Err(ConfigError::InvalidDuration {
                field: format!("{}.SampleInterval", self.guid),
                value: self.sample_interval.clone(),
            });
        }
        for (field, clause) in [
            ("FilterFunc", &self.filter_func),
            ("PostQueryOp", &self.post_query_op),
        ] {
            if !is_pipe_clause(clause) {
                return Err(ConfigError::InvalidClause {
                    metric: self.guid.clone(),
                    field,
                    clause: clause.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Whether `clause` may be spliced into a query.
///
/// Accepts the empty string or a sequence of pipe-forward calls that neither
/// read from nor write to a bucket.
pub fn is_pipe_clause(clause: &str) -> bool {
    let trimmed = clause.trim();
    if trimmed.is_empty() {
        return true;
    }
    trimmed.starts_with("|>") && !FORBIDDEN_CALL.is_match(trimmed)
}

/// Settings shared by physical and virtual partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BasePartitionConfig {
    /// Maximum wall clock time in seconds
    pub max_time: i64,
    /// Metric GUIDs available in the partition
    pub metrics: Vec<String>,
}

/// A subset of a partition's nodes with its own metric list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VirtualPartitionConfig {
    #[serde(flatten)]
    pub base: BasePartitionConfig,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PartitionConfig {
    #[serde(flatten)]
    pub base: BasePartitionConfig,
    pub virtual_partitions: BTreeMap<String, VirtualPartitionConfig>,
}

impl PartitionConfig {
    /// Drop references to the given metric GUIDs.
    pub fn remove_missing_metrics(&mut self, guids: &[String]) {
        self.base.metrics.retain(|m| !guids.contains(m));
        for vp in self.virtual_partitions.values_mut() {
            vp.base.metrics.retain(|m| !guids.contains(m));
        }
    }
}

fn default_sample_interval() -> String {
    "30s".to_string()
}

fn default_query_timeout() -> String {
    "60s".to_string()
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Configuration {
    #[serde(flatten)]
    pub db: DbConfig,
    #[serde(default)]
    pub job_store: JobStoreConfig,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    /// Capacity of the job data cache; 0 disables caching
    #[serde(default)]
    pub cache_size: usize,
    /// Prefetch job data into the cache when a job stops
    #[serde(default)]
    pub prefetch: bool,
    /// Collector sample interval used when a metric does not set its own
    #[serde(default = "default_sample_interval")]
    pub sample_interval: String,
    /// Quantiles as decimal strings, e.g. "0.25"
    #[serde(default)]
    pub metric_quantiles: Vec<String>,
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionConfig>,
    /// TTL in seconds applied to jobs that arrive without one
    #[serde(rename = "DefaultTTL", default)]
    pub default_ttl: i64,
    /// Per-request timeout for backend queries
    #[serde(default = "default_query_timeout")]
    pub query_timeout: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            db: DbConfig::default(),
            job_store: JobStoreConfig::default(),
            metrics: Vec::new(),
            cache_size: 0,
            prefetch: false,
            sample_interval: default_sample_interval(),
            metric_quantiles: Vec::new(),
            partitions: BTreeMap::new(),
            default_ttl: 0,
            query_timeout: default_query_timeout(),
        }
    }
}

impl Configuration {
    /// Read, normalize and validate a configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        config.log_loaded(path);
        Ok(config)
    }

    /// Load the file at `path` as the successor of `previous`.
    ///
    /// Partition references to metrics that were in `previous` but are gone
    /// from the file are dropped before validation. Returns the removed
    /// GUIDs along with the configuration.
    pub fn reload(
        path: &Utf8Path,
        previous: &MetricCatalog,
    ) -> Result<(Self, Vec<String>), ConfigError> {
        let mut config = Self::read(path)?;
        let deleted = config.deleted_metrics(previous);
        config.prune_metrics(&deleted);
        config.validate()?;
        config.log_loaded(path);
        Ok((config, deleted))
    }

    fn read(path: &Utf8Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config: Configuration =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        config.normalize();
        Ok(config)
    }

    fn log_loaded(&self, path: &Utf8Path) {
        tracing::info!(
            path = %path,
            metrics = self.metrics.len(),
            partitions = self.partitions.len(),
            "Loaded configuration"
        );
    }

    /// Fill in missing GUIDs and order metrics by display name.
    pub fn normalize(&mut self) {
        for metric in &mut self.metrics {
            if metric.guid.is_empty() {
                metric.guid = metric.measurement.clone();
            }
        }
        self.metrics
            .sort_by(|a, b| a.display_name.cmp(&b.display_name));
    }

    /// Check metric, partition, duration and quantile settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if parse_duration(&self.sample_interval).is_none() {
            return Err(ConfigError::InvalidDuration {
                field: "SampleInterval".to_string(),
                value: self.sample_interval.clone(),
            });
        }
        if parse_duration(&self.query_timeout).is_none() {
            return Err(ConfigError::InvalidDuration {
                field: "QueryTimeout".to_string(),
                value: self.query_timeout.clone(),
            });
        }
        if self.default_ttl < 0 {
            return Err(ConfigError::InvalidDuration {
                field: "DefaultTTL".to_string(),
                value: self.default_ttl.to_string(),
            });
        }

        if self.metric_quantiles.len() > MAX_QUANTILES {
            return Err(ConfigError::TooManyQuantiles(self.metric_quantiles.len()));
        }
        for q in &self.metric_quantiles {
            match q.parse::<f64>() {
                Ok(v) if (0.0..=1.0).contains(&v) => {}
                _ => return Err(ConfigError::InvalidQuantile(q.clone())),
            }
        }

        let mut guids = HashSet::new();
        for metric in &self.metrics {
            if !guids.insert(metric.guid.as_str()) {
                return Err(ConfigError::DuplicateMetric(metric.guid.clone()));
            }
            metric.validate()?;
        }

        for (name, partition) in &self.partitions {
            let referenced = partition.base.metrics.iter().chain(
                partition
                    .virtual_partitions
                    .values()
                    .flat_map(|vp| vp.base.metrics.iter()),
            );
            for guid in referenced {
                if !guids.contains(guid.as_str()) {
                    return Err(ConfigError::UnknownMetric {
                        partition: name.clone(),
                        metric: guid.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Check that every backend connection setting is present.
    pub fn require_backend(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("DBHost", &self.db.host),
            ("DBToken", &self.db.token),
            ("DBOrg", &self.db.org),
            ("DBBucket", &self.db.bucket),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }
        Ok(())
    }

    /// Default sample interval as a duration (30s if unparsable).
    pub fn default_interval(&self) -> Duration {
        parse_duration(&self.sample_interval).unwrap_or(Duration::from_secs(30))
    }

    /// Backend query timeout (60s if unparsable).
    pub fn query_timeout(&self) -> Duration {
        parse_duration(&self.query_timeout).unwrap_or(Duration::from_secs(60))
    }

    /// GUIDs known to `previous` but missing here.
    pub fn deleted_metrics(&self, previous: &MetricCatalog) -> Vec<String> {
        let available: HashSet<&str> = self.metrics.iter().map(|m| m.guid.as_str()).collect();
        previous
            .metrics()
            .filter(|m| !available.contains(m.guid.as_str()))
            .map(|m| m.guid.clone())
            .collect()
    }

    /// Drop partition references to the given metric GUIDs.
    pub fn prune_metrics(&mut self, guids: &[String]) {
        for partition in self.partitions.values_mut() {
            partition.remove_missing_metrics(guids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn metric(guid: &str, kind: &str) -> MetricConfig {
        MetricConfig {
            guid: guid.to_string(),
            kind: kind.to_string(),
            measurement: guid.to_string(),
            agg_fn: "mean".to_string(),
            available_agg_fns: vec!["mean".to_string(), "max".to_string()],
            display_name: guid.to_uppercase(),
            ..Default::default()
        }
    }

    fn config_with(metrics: Vec<MetricConfig>, partition_metrics: &[&str]) -> Configuration {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            "main".to_string(),
            PartitionConfig {
                base: BasePartitionConfig {
                    max_time: 3600,
                    metrics: partition_metrics.iter().map(|s| s.to_string()).collect(),
                },
                virtual_partitions: BTreeMap::new(),
            },
        );
        Configuration {
            metrics,
            partitions,
            ..Default::default()
        }
    }

    #[test]
    fn test_load_config_file() {
        let json = r#"{
            "DBHost": "http://localhost:8086",
            "DBToken": "secret",
            "DBOrg": "hpc",
            "DBBucket": "metrics",
            "JobStore": {"Type": "sqlite", "Path": "sqlite://jobs.db"},
            "Metrics": [
                {"GUID": "b", "Type": "cpu", "Measurement": "cpu_load", "AggFn": "mean",
                 "AvailableAggFns": ["mean", "max"], "DisplayName": "Load", "SeparationKey": "cpu"},
                {"GUID": "a", "Type": "node", "Measurement": "mem_used", "AggFn": "max",
                 "DisplayName": "Memory"}
            ],
            "CacheSize": 20,
            "MetricQuantiles": ["0.25", "0.5", "0.75"],
            "Partitions": {
                "main": {"MaxTime": 86400, "Metrics": ["a", "b"],
                         "VirtualPartitions": {"gpu": {"MaxTime": 3600, "Metrics": ["a"], "Nodes": ["g1"]}}}
            },
            "OAuth": {"ClientID": "ignored"}
        }"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let path = Utf8Path::from_path(file.path()).unwrap();

        let config = Configuration::load(path).unwrap();
        assert_eq!(config.db.host, "http://localhost:8086");
        assert_eq!(config.db.bucket, "metrics");
        assert_eq!(
            config.job_store,
            JobStoreConfig::Sqlite {
                path: "sqlite://jobs.db".to_string()
            }
        );
        assert_eq!(config.cache_size, 20);
        assert_eq!(config.default_interval(), Duration::from_secs(30));
        // Sorted by display name
        assert_eq!(config.metrics[0].display_name, "Load");
        assert_eq!(config.metrics[1].display_name, "Memory");
        let vp = &config.partitions["main"].virtual_partitions["gpu"];
        assert_eq!(vp.base.max_time, 3600);
        assert_eq!(vp.nodes, vec!["g1"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Configuration::load(Utf8Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_unknown_agg_fn_rejected() {
        let mut m = metric("cpu", "cpu");
        m.available_agg_fns.push("median".to_string());
        let config = config_with(vec![m], &["cpu"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownAggFn { agg_fn, .. }) if agg_fn == "median"
        ));
    }

    #[test]
    fn test_unknown_partition_metric_rejected() {
        let config = config_with(vec![metric("cpu", "cpu")], &["cpu", "gpu"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownMetric { metric, .. }) if metric == "gpu"
        ));
    }

    #[test]
    fn test_invalid_quantile_rejected() {
        let mut config = config_with(vec![metric("cpu", "cpu")], &["cpu"]);
        config.metric_quantiles = vec!["0.5".to_string(), "1.5".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQuantile(q)) if q == "1.5"
        ));
    }

    #[test]
    fn test_invalid_clause_rejected() {
        let mut m = metric("cpu", "cpu");
        m.post_query_op = r#"|> to(bucket: "other")"#.to_string();
        let config = config_with(vec![m], &["cpu"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidClause { field: "PostQueryOp", .. })
        ));
    }

    #[test]
    fn test_pipe_clause() {
        assert!(is_pipe_clause(""));
        assert!(is_pipe_clause(r#"|> filter(fn: (r) => r["type"] == "cpu")"#));
        assert!(is_pipe_clause("|> toFloat() |> last()"));
        assert!(!is_pipe_clause("filter(fn: (r) => true)"));
        assert!(!is_pipe_clause(r#"|> yield(name: "x")"#));
        assert!(!is_pipe_clause(r#") from(bucket: "other")"#));
    }

    #[test]
    fn test_deleted_metrics_and_prune() {
        let old = config_with(vec![metric("cpu", "cpu"), metric("mem", "node")], &["cpu", "mem"]);
        let mut new = config_with(vec![metric("cpu", "cpu")], &["cpu", "mem"]);
        let deleted = new.deleted_metrics(&MetricCatalog::from_config(&old));
        assert_eq!(deleted, vec!["mem".to_string()]);

        new.prune_metrics(&deleted);
        assert_eq!(new.partitions["main"].base.metrics, vec!["cpu".to_string()]);
        assert!(new.validate().is_ok());
    }

    #[test]
    fn test_reload_prunes_removed_metrics() {
        let json = r#"{
            "Metrics": [{"GUID": "cpu", "Type": "cpu", "Measurement": "cpu_load", "AggFn": "mean"}],
            "Partitions": {"main": {"Metrics": ["cpu", "mem"]}}
        }"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let path = Utf8Path::from_path(file.path()).unwrap();

        assert!(matches!(
            Configuration::load(path),
            Err(ConfigError::UnknownMetric { .. })
        ));

        let previous = config_with(vec![metric("cpu", "cpu"), metric("mem", "node")], &["cpu", "mem"]);
        let (config, deleted) =
            Configuration::reload(path, &MetricCatalog::from_config(&previous)).unwrap();
        assert_eq!(deleted, vec!["mem".to_string()]);
        assert_eq!(config.partitions["main"].base.metrics, vec!["cpu".to_string()]);
    }

    #[test]
    fn test_require_backend() {
        let mut config = Configuration::default();
        assert!(matches!(
            config.require_backend(),
            Err(ConfigError::Missing("DBHost"))
        ));
        config.db = DbConfig {
            host: "http://localhost:8086".to_string(),
            token: "t".to_string(),
            org: "hpc".to_string(),
            bucket: String::new(),
        };
        assert!(matches!(
            config.require_backend(),
            Err(ConfigError::Missing("DBBucket"))
        ));
    }

    #[test]
    fn test_missing_guid_uses_measurement() {
        let mut m = metric("", "node");
        m.measurement = "mem_used".to_string();
        let mut config = config_with(vec![m], &["mem_used"]);
        config.normalize();
        assert_eq!(config.metrics[0].guid, "mem_used");
        assert!(config.validate().is_ok());
    }
}
