//! Per-partition metric resolution.

use crate::config::{BasePartitionConfig, Configuration, MetricConfig, PartitionConfig};
use crate::job::Job;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Wall clock limit in seconds for jobs in partitions without a configuration.
pub const FALLBACK_MAX_TIME: i64 = 86_400;

/// Metric definitions indexed by GUID plus the partition table.
#[derive(Debug, Clone, Default)]
pub struct MetricCatalog {
    metrics: HashMap<String, MetricConfig>,
    /// GUIDs in display order
    order: Vec<String>,
    partitions: BTreeMap<String, PartitionConfig>,
}

impl MetricCatalog {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            metrics: config
                .metrics
                .iter()
                .map(|m| (m.guid.clone(), m.clone()))
                .collect(),
            order: config.metrics.iter().map(|m| m.guid.clone()).collect(),
            partitions: config.partitions.clone(),
        }
    }

    pub fn metric(&self, guid: &str) -> Option<&MetricConfig> {
        self.metrics.get(guid)
    }

    /// All metrics in display order.
    pub fn metrics(&self) -> impl Iterator<Item = &MetricConfig> {
        self.order.iter().filter_map(|guid| self.metrics.get(guid))
    }

    /// Resolve the partition settings that apply to `job`.
    ///
    /// A virtual partition applies when it contains every node of the job;
    /// virtual partitions are tried in name order. Returns None for unknown
    /// partitions.
    pub fn partition_for(&self, job: &Job) -> Option<&BasePartitionConfig> {
        let partition = self.partitions.get(&job.partition)?;
        let vp = partition
            .virtual_partitions
            .values()
            .find(|vp| job.nodes().all(|n| vp.nodes.iter().any(|v| v == n)));
        Some(vp.map_or(&partition.base, |vp| &vp.base))
    }

    /// Metrics available for `job`, in the order the partition lists them.
    pub fn metrics_for(&self, job: &Job) -> Vec<MetricConfig> {
        let Some(partition) = self.partition_for(job) else {
            tracing::warn!(
                job_id = job.id,
                partition = %job.partition,
                "No configuration for partition"
            );
            return Vec::new();
        };
        partition
            .metrics
            .iter()
            .filter_map(|guid| self.metrics.get(guid).cloned())
            .collect()
    }

    /// Maximum wall clock time in seconds for `job`.
    pub fn max_time(&self, job: &Job) -> i64 {
        match self.partition_for(job) {
            Some(p) if p.max_time > 0 => p.max_time,
            _ => FALLBACK_MAX_TIME,
        }
    }
}

/// Shared, swappable catalog snapshot.
///
/// Readers take a cheap `Arc` clone; a configuration reload replaces the
/// whole snapshot.
#[derive(Debug, Clone, Default)]
pub struct CatalogHandle(Arc<RwLock<Arc<MetricCatalog>>>);

impl CatalogHandle {
    pub fn new(catalog: MetricCatalog) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(catalog))))
    }

    pub fn snapshot(&self) -> Arc<MetricCatalog> {
        match self.0.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, catalog: MetricCatalog) {
        let mut guard = match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(catalog);
    }
}
