use jobmon_core::{ErrorKind, Job, JobData};
use jobmon_engine::{EngineError, MetricsSource};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] EngineError),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    interval: Duration,
    data: JobData,
}

/// Cache-aside store of finished-job datasets.
///
/// One lock covers lookups, fetches on miss and metadata refreshes, so
/// concurrent misses for the same job fetch once.
pub struct ResultCache {
    source: Arc<dyn MetricsSource>,
    entries: Mutex<Option<LruCache<i64, Entry>>>,
}

impl ResultCache {
    /// A capacity of zero disables caching; every lookup fetches.
    pub fn new(source: Arc<dyn MetricsSource>, capacity: usize) -> Self {
        Self {
            source,
            entries: Mutex::new(NonZeroUsize::new(capacity).map(LruCache::new)),
        }
    }

    /// Dataset of `job` at `interval`, fetched on miss.
    ///
    /// An entry cached at a different interval counts as a miss and is
    /// replaced. Failed fetches are not cached.
    pub async fn get(&self, job: &Job, interval: Duration) -> Result<JobData, CacheError> {
        let mut guard = self.entries.lock().await;
        let Some(entries) = guard.as_mut() else {
            return Ok(self.source.job_data(job, interval).await?);
        };
        if let Some(entry) = entries.get(&job.id) {
            if entry.interval == interval {
                tracing::debug!(job = job.id, "Result cache hit");
                return Ok(entry.data.clone());
            }
        }

        tracing::debug!(job = job.id, interval = ?interval, "Result cache miss");
        let data = self.source.job_data(job, interval).await?;
        let entry = Entry {
            interval,
            data: data.clone(),
        };
        if let Some((evicted, _)) = entries.push(job.id, entry) {
            if evicted != job.id {
                tracing::debug!(job = evicted, "Evicted from result cache");
            }
        }
        Ok(data)
    }

    /// Replace the metadata of the cached entry for `job`, if any.
    ///
    /// The entry becomes most recently used; no other entry is touched.
    /// Returns whether an entry was updated.
    pub async fn update_job(&self, job: &Job) -> bool {
        let mut guard = self.entries.lock().await;
        match guard.as_mut().and_then(|entries| entries.get_mut(&job.id)) {
            Some(entry) => {
                entry.data.metadata = job.clone();
                true
            }
            None => false,
        }
    }

    /// Drop the entry for a job. Returns whether one was cached.
    pub async fn invalidate(&self, id: i64) -> bool {
        let mut guard = self.entries.lock().await;
        guard
            .as_mut()
            .is_some_and(|entries| entries.pop(&id).is_some())
    }

    pub async fn contains(&self, id: i64) -> bool {
        let guard = self.entries.lock().await;
        guard.as_ref().is_some_and(|entries| entries.contains(&id))
    }

    pub async fn len(&self) -> usize {
        let guard = self.entries.lock().await;
        guard.as_ref().map_or(0, LruCache::len)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cached job ids from most to least recently used.
    pub async fn job_ids(&self) -> Vec<i64> {
        let guard = self.entries.lock().await;
        guard
            .as_ref()
            .map(|entries| entries.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobmon_core::{MetricSummary, Tag};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MetricsSource for CountingSource {
        async fn job_data(&self, job: &Job, interval: Duration) -> Result<JobData, EngineError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            if job.id < 0 {
                return Err(EngineError::NoData(job.id));
            }
            Ok(JobData {
                metadata: job.clone(),
                metric_data: Vec::new(),
                quantile_data: Vec::new(),
                sample_interval: interval.as_secs_f64(),
                sample_intervals: vec![interval.as_secs_f64()],
            })
        }

        async fn metadata_metrics(&self, _job: &Job) -> Result<Vec<MetricSummary>, EngineError> {
            Ok(Vec::new())
        }
    }

    fn job(id: i64) -> Job {
        Job {
            id,
            ..Default::default()
        }
    }

    const MIN: Duration = Duration::from_secs(60);

    fn cache(capacity: usize) -> (ResultCache, Arc<CountingSource>) {
        let source = Arc::new(CountingSource::default());
        (ResultCache::new(source.clone(), capacity), source)
    }

    #[tokio::test]
    async fn test_hit_does_not_fetch() {
        let (cache, source) = cache(2);
        cache.get(&job(1), MIN).await.unwrap();
        cache.get(&job(1), MIN).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_eviction_and_promotion() {
        let (cache, source) = cache(2);
        cache.get(&job(1), MIN).await.unwrap();
        cache.get(&job(2), MIN).await.unwrap();
        cache.get(&job(1), MIN).await.unwrap();
        cache.get(&job(3), MIN).await.unwrap();

        assert_eq!(cache.job_ids().await, vec![3, 1]);
        assert_eq!(source.fetches.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_interval_mismatch_is_a_miss() {
        let (cache, source) = cache(2);
        cache.get(&job(1), MIN).await.unwrap();
        let data = cache.get(&job(1), 2 * MIN).await.unwrap();
        assert_eq!(data.sample_interval, 120.0);
        assert_eq!(cache.len().await, 1);
        assert_eq!(source.fetches.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_update_keeps_membership() {
        let (cache, _) = cache(2);
        cache.get(&job(1), MIN).await.unwrap();
        cache.get(&job(2), MIN).await.unwrap();

        let mut tagged = job(1);
        tagged.tags.push(Tag {
            id: 7,
            name: "slow".to_string(),
            kind: "user".to_string(),
            created_by: "alice".to_string(),
        });
        assert!(cache.update_job(&tagged).await);
        assert!(!cache.update_job(&job(9)).await);
        assert_eq!(cache.job_ids().await, vec![1, 2]);

        let data = cache.get(&job(1), MIN).await.unwrap();
        assert_eq!(data.metadata.tags.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let (cache, _) = cache(2);
        let err = cache.get(&job(-1), MIN).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_zero_capacity_disables() {
        let (cache, source) = cache(0);
        cache.get(&job(1), MIN).await.unwrap();
        cache.get(&job(1), MIN).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::Relaxed), 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_refetch_at_capacity_keeps_others() {
        let (cache, source) = cache(2);
        cache.get(&job(1), MIN).await.unwrap();
        cache.get(&job(2), MIN).await.unwrap();
        cache.get(&job(1), 2 * MIN).await.unwrap();

        assert_eq!(cache.job_ids().await, vec![1, 2]);
        cache.get(&job(2), MIN).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let (cache, _) = cache(2);
        cache.get(&job(1), MIN).await.unwrap();
        assert!(cache.invalidate(1).await);
        assert!(!cache.invalidate(1).await);
        assert!(!cache.contains(1).await);
    }
}
