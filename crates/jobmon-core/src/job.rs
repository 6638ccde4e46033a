//! Job metadata and tag types.

use crate::config::MetricConfig;
use crate::error::JobValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on datapoints per series when choosing a sample interval.
pub const DEFAULT_MAX_POINTS_PER_JOB: f64 = 200.0;

/// Sample intervals (seconds) offered to clients.
const DEFAULT_SAMPLE_INTERVALS: [f64; 6] = [30.0, 60.0, 120.0, 300.0, 600.0, 1800.0];

/// Separator between hostnames in a node list.
pub const NODE_SEPARATOR: char = '|';

/// A job tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    /// Stable identifier
    pub id: i64,
    pub name: String,
    /// Role of the creator, e.g. "user" or "admin"
    #[serde(rename = "Type")]
    pub kind: String,
    pub created_by: String,
}

/// Tag as submitted by a client, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NewTag {
    pub name: String,
    #[serde(rename = "Type")]
    pub kind: String,
    pub created_by: String,
}

impl NewTag {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            created_by: created_by.into(),
        }
    }

    pub fn with_id(self, id: i64) -> Tag {
        Tag {
            id,
            name: self.name,
            kind: self.kind,
            created_by: self.created_by,
        }
    }
}

/// Per-metric summary computed when a job finalizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricSummary {
    pub config: MetricConfig,
    /// Mean over the whole job
    #[serde(rename = "Data")]
    pub mean: f64,
    /// Median of the five highest values per time bucket
    pub max: f64,
    /// Boundaries of statistically homogeneous segments
    #[serde(default)]
    pub change_points: Vec<DateTime<Utc>>,
}

/// Stop event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StopJob {
    pub exit_code: i32,
    pub stop_time: i64,
}

/// Metadata of a batch job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Job {
    /// Scheduler job id
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub group_id: i64,
    pub group_name: String,
    pub cluster_id: String,
    pub num_nodes: u32,
    pub num_tasks: u32,
    pub tasks_per_node: u32,
    #[serde(rename = "GPUsPerNode")]
    pub gpus_per_node: u32,
    /// Hostnames joined by `|`
    pub node_list: String,
    /// Epoch seconds
    pub start_time: i64,
    /// Epoch seconds, 0 while running
    pub stop_time: i64,
    pub is_running: bool,
    pub job_name: String,
    pub account: String,
    /// Seconds to keep the job after it stopped; 0 keeps it forever
    #[serde(rename = "TTL")]
    pub ttl: i64,
    pub partition: String,
    pub job_script: String,
    pub exit_code: i32,
    pub tags: Vec<Tag>,
    /// Metric summaries, set once the job is finalized
    #[serde(rename = "Data")]
    pub summaries: Option<Vec<MetricSummary>>,
}

impl Job {
    /// Hostnames the job ran on, in submission order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.node_list
            .split(NODE_SEPARATOR)
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.nodes().any(|n| n == node)
    }

    /// Total GPUs allocated to the job.
    pub fn num_gpus(&self) -> i64 {
        i64::from(self.num_nodes) * i64::from(self.gpus_per_node)
    }

    /// Check record invariants.
    pub fn validate(&self) -> Result<(), JobValidationError> {
        let actual = self.node_count();
        if actual != self.num_nodes as usize {
            return Err(JobValidationError::NodeCountMismatch {
                id: self.id,
                expected: self.num_nodes,
                actual,
            });
        }
        if self.ttl < 0 {
            return Err(JobValidationError::NegativeTtl {
                id: self.id,
                ttl: self.ttl,
            });
        }
        if !self.is_running && self.stop_time < self.start_time {
            return Err(JobValidationError::StopBeforeStart {
                id: self.id,
                start: self.start_time,
                stop: self.stop_time,
            });
        }
        Ok(())
    }

    /// Whether the TTL of a stopped job has run out. TTL 0 never expires.
    pub fn expired(&self, now: i64) -> bool {
        if self.ttl == 0 {
            return false;
        }
        self.stop_time + self.ttl < now
    }

    /// Whether the job exceeded `max_time` seconds of wall clock time.
    pub fn overtime(&self, max_time: i64, now: i64) -> bool {
        self.start_time + max_time < now
    }

    /// Add a tag unless a tag with the same id is already attached.
    ///
    /// Returns true if the tag was added.
    pub fn add_tag(&mut self, tag: &Tag) -> bool {
        if self.has_tag(tag.id) {
            return false;
        }
        self.tags.push(tag.clone());
        true
    }

    /// Detach the tag with the given id. Returns true if it was attached.
    pub fn remove_tag(&mut self, tag_id: i64) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t.id != tag_id);
        self.tags.len() != before
    }

    pub fn has_tag(&self, tag_id: i64) -> bool {
        self.tags.iter().any(|t| t.id == tag_id)
    }

    /// Pick sample intervals for this job.
    ///
    /// Returns the selectable intervals (seconds) and the interval that
    /// yields closest to [`DEFAULT_MAX_POINTS_PER_JOB`] points. Running jobs
    /// are measured up to `now`.
    pub fn sample_intervals(&self, metric_interval: Duration, now: i64) -> (Vec<f64>, Duration) {
        let metric_secs = metric_interval.as_secs_f64().max(1.0);
        let stop = if self.is_running { now } else { self.stop_time };
        let duration = (stop - self.start_time).max(0) as f64;

        let datapoints = duration / metric_secs;
        let factor = (datapoints / DEFAULT_MAX_POINTS_PER_JOB).ceil();
        let best = factor * metric_secs;

        let mut best_available = metric_secs;
        for v in DEFAULT_SAMPLE_INTERVALS {
            if (v - best).abs() < (best_available - best).abs() {
                best_available = v;
            }
        }

        let intervals = DEFAULT_SAMPLE_INTERVALS
            .iter()
            .copied()
            .filter(|v| metric_secs <= *v && *v <= best_available)
            .collect();

        (intervals, Duration::from_secs_f64(best_available))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(nodes: &str, num_nodes: u32) -> Job {
        Job {
            id: 1,
            num_nodes,
            node_list: nodes.to_string(),
            start_time: 1000,
            stop_time: 2000,
            ..Default::default()
        }
    }

    fn tag(id: i64) -> Tag {
        NewTag::new(format!("tag-{id}"), "user", "alice").with_id(id)
    }

    #[test]
    fn test_nodes() {
        let j = job("n01|n02|n03", 3);
        assert_eq!(j.nodes().collect::<Vec<_>>(), vec!["n01", "n02", "n03"]);
        assert!(j.has_node("n02"));
        assert!(!j.has_node("n04"));
        assert!(j.validate().is_ok());
    }

    #[test]
    fn test_validate_node_count() {
        let j = job("n01|n02", 3);
        assert_eq!(
            j.validate(),
            Err(JobValidationError::NodeCountMismatch {
                id: 1,
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_validate_stop_before_start() {
        let mut j = job("n01", 1);
        j.stop_time = 500;
        assert!(matches!(
            j.validate(),
            Err(JobValidationError::StopBeforeStart { .. })
        ));
        j.is_running = true;
        assert!(j.validate().is_ok());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let mut j = job("n01", 1);
        j.ttl = 0;
        assert!(!j.expired(i64::MAX));
    }

    #[test]
    fn test_ttl_expiry_boundary() {
        let mut j = job("n01", 1);
        j.ttl = 100;
        // stop 2000 + ttl 100
        assert!(!j.expired(2099));
        assert!(!j.expired(2100));
        assert!(j.expired(2101));
    }

    #[test]
    fn test_overtime_boundary() {
        let j = job("n01", 1);
        assert!(!j.overtime(3600, 4600));
        assert!(j.overtime(3600, 4601));
    }

    #[test]
    fn test_tags_are_unique_by_id() {
        let mut j = job("n01", 1);
        assert!(j.add_tag(&tag(7)));
        assert!(!j.add_tag(&tag(7)));
        assert_eq!(j.tags.len(), 1);
        assert!(j.remove_tag(7));
        assert!(!j.remove_tag(7));
        assert!(j.tags.is_empty());
    }

    #[test]
    fn test_sample_intervals_short_job() {
        // 1000 seconds at 30s resolution is 34 points, so 30s is best
        let j = job("n01", 1);
        let (intervals, best) = j.sample_intervals(Duration::from_secs(30), 0);
        assert_eq!(best, Duration::from_secs(30));
        assert_eq!(intervals, vec![30.0]);
    }

    #[test]
    fn test_sample_intervals_long_job() {
        // 10 hours at 30s is 1200 points, factor 6 gives 180s, closest is 120s
        let mut j = job("n01", 1);
        j.stop_time = j.start_time + 36_000;
        let (intervals, best) = j.sample_intervals(Duration::from_secs(30), 0);
        assert_eq!(best, Duration::from_secs(120));
        assert_eq!(intervals, vec![30.0, 60.0, 120.0]);
    }

    #[test]
    fn test_sample_intervals_running_job_uses_now() {
        let mut j = job("n01", 1);
        j.is_running = true;
        j.stop_time = 0;
        let (_, best) = j.sample_intervals(Duration::from_secs(30), j.start_time + 360_000);
        assert_eq!(best, Duration::from_secs(1800));
    }

    #[test]
    fn test_job_json_shape() {
        let mut j = job("n01", 1);
        j.gpus_per_node = 4;
        j.ttl = 60;
        let value = serde_json::to_value(&j).unwrap();
        assert_eq!(value["Id"], 1);
        assert_eq!(value["NodeList"], "n01");
        assert_eq!(value["GPUsPerNode"], 4);
        assert_eq!(value["TTL"], 60);
        assert!(value["Data"].is_null());
    }
}
