//! Job search filters.

use crate::job::Job;
use serde::{Deserialize, Serialize};

/// Inclusive integer range; an absent bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RangeFilter {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl RangeFilter {
    pub fn new(from: Option<i64>, to: Option<i64>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.from.is_none_or(|from| value >= from) && self.to.is_none_or(|to| value <= to)
    }
}

/// Criteria for [`Job`] searches. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct JobFilter {
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub is_running: Option<bool>,
    pub partition: Option<String>,
    pub num_nodes: Option<RangeFilter>,
    pub num_tasks: Option<RangeFilter>,
    /// Total GPUs, `NumNodes * GPUsPerNode`
    pub num_gpus: Option<RangeFilter>,
    /// Range on the start time
    pub time: Option<RangeFilter>,
    /// Tag ids the job must all carry
    pub tags: Option<Vec<i64>>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        fn eq<T: PartialEq + ?Sized>(want: Option<&T>, have: &T) -> bool {
            want.is_none_or(|w| w == have)
        }
        fn range(want: &Option<RangeFilter>, have: i64) -> bool {
            want.as_ref().is_none_or(|r| r.contains(have))
        }

        eq(self.user_id.as_ref(), &job.user_id)
            && eq(self.user_name.as_deref(), job.user_name.as_str())
            && eq(self.group_id.as_ref(), &job.group_id)
            && eq(self.group_name.as_deref(), job.group_name.as_str())
            && eq(self.is_running.as_ref(), &job.is_running)
            && eq(self.partition.as_deref(), job.partition.as_str())
            && range(&self.num_nodes, i64::from(job.num_nodes))
            && range(&self.num_tasks, i64::from(job.num_tasks))
            && range(&self.num_gpus, job.num_gpus())
            && range(&self.time, job.start_time)
            && self
                .tags
                .as_ref()
                .is_none_or(|tags| tags.iter().all(|id| job.has_tag(*id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewTag;

    fn job() -> Job {
        let mut j = Job {
            id: 3,
            user_id: 1000,
            user_name: "alice".to_string(),
            group_name: "lab".to_string(),
            partition: "main".to_string(),
            num_nodes: 2,
            gpus_per_node: 4,
            node_list: "n01|n02".to_string(),
            start_time: 5000,
            ..Default::default()
        };
        j.add_tag(&NewTag::new("slow", "user", "alice").with_id(1));
        j.add_tag(&NewTag::new("oom", "user", "alice").with_id(2));
        j
    }

    #[test]
    fn test_range_filter() {
        let r = RangeFilter::new(Some(2), Some(4));
        assert!(!r.contains(1));
        assert!(r.contains(2));
        assert!(r.contains(4));
        assert!(!r.contains(5));
        assert!(RangeFilter::default().contains(i64::MIN));
    }

    #[test]
    fn test_empty_filter_matches() {
        assert!(JobFilter::default().matches(&job()));
    }

    #[test]
    fn test_exact_and_range_fields() {
        let j = job();
        let f = JobFilter {
            user_name: Some("alice".to_string()),
            partition: Some("main".to_string()),
            num_gpus: Some(RangeFilter::new(Some(8), None)),
            ..Default::default()
        };
        assert!(f.matches(&j));

        let f = JobFilter {
            group_name: Some("other".to_string()),
            ..Default::default()
        };
        assert!(!f.matches(&j));

        let f = JobFilter {
            time: Some(RangeFilter::new(None, Some(4999))),
            ..Default::default()
        };
        assert!(!f.matches(&j));
    }

    #[test]
    fn test_tags_require_all() {
        let j = job();
        let both = JobFilter {
            tags: Some(vec![1, 2]),
            ..Default::default()
        };
        assert!(both.matches(&j));

        let missing = JobFilter {
            tags: Some(vec![1, 3]),
            ..Default::default()
        };
        assert!(!missing.matches(&j));

        let empty = JobFilter {
            tags: Some(vec![]),
            ..Default::default()
        };
        assert!(empty.matches(&j));
    }
}
