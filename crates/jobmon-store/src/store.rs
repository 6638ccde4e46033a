use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use async_trait::async_trait;
use jobmon_core::{Job, JobFilter, JobStoreConfig, JobValidationError, MetricSummary, StopJob, Tag};
use std::sync::Arc;

/// Persistence of job metadata and tags.
///
/// Stores only check record-level rules; enrichment and the janitors are
/// layered on top by [`crate::JobLifecycle`].
#[async_trait]
pub trait JobStore: SessionStore + Send + Sync {
    /// Insert a new job. Fails if the id is taken.
    async fn put_job(&self, job: Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: i64) -> Result<Job, StoreError>;

    /// All jobs, ordered by id.
    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Jobs matching `filter`, ordered by id.
    async fn get_filtered_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Record the stop of a running job and return the updated record.
    async fn mark_stopped(&self, id: i64, stop: StopJob) -> Result<Job, StoreError>;

    /// Replace the record of an existing job, tags included.
    async fn update_job(&self, job: Job) -> Result<(), StoreError>;

    /// Replace only the metric summaries of a job and return the current
    /// record. Tags and metadata written since the job was read are kept.
    async fn set_summaries(
        &self,
        id: i64,
        summaries: Option<Vec<MetricSummary>>,
    ) -> Result<Job, StoreError>;

    /// Delete a job with its tag links and summaries. Returns false if it
    /// did not exist.
    async fn delete_job(&self, id: i64) -> Result<bool, StoreError>;

    /// Attach `tag` to a job and return the stored tag.
    ///
    /// A tag with id 0 is looked up by name, type and creator and created
    /// if missing. Attaching a tag twice is a no-op.
    async fn add_tag(&self, id: i64, tag: Tag) -> Result<Tag, StoreError>;

    /// Detach a tag from a job. Detaching an absent tag is a no-op.
    async fn remove_tag(&self, id: i64, tag_id: i64) -> Result<(), StoreError>;

    /// Tags attached to jobs of `user`, or to any job, ordered by id.
    async fn get_job_tags(&self, user: Option<&str>) -> Result<Vec<Tag>, StoreError>;

    /// Tags whose name contains `term` (case-insensitive), restricted to
    /// tags on jobs of `user` if given.
    async fn search_tags(&self, term: &str, user: Option<&str>) -> Result<Vec<Tag>, StoreError>;

    /// Names of users with at least one job, optionally containing `term`.
    async fn users_with_jobs(&self, term: Option<&str>) -> Result<Vec<String>, StoreError>;

    /// Jobs whose id, name or account contains `term`, restricted to jobs
    /// of `user` if given.
    async fn search_jobs(&self, term: &str, user: Option<&str>) -> Result<Vec<Job>, StoreError>;

    /// Persist pending state and release resources.
    async fn flush(&self) -> Result<(), StoreError>;
}

/// Per-user session tokens and roles.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session_token(&self, user: &str) -> Result<Option<String>, StoreError>;

    async fn set_session_token(&self, user: &str, token: &str) -> Result<(), StoreError>;

    async fn remove_session(&self, user: &str) -> Result<(), StoreError>;

    async fn get_user_roles(&self, user: &str) -> Result<Option<Vec<String>>, StoreError>;

    async fn set_user_roles(&self, user: &str, roles: &[String]) -> Result<(), StoreError>;
}

/// Open the store selected in the configuration.
pub async fn open_store(config: &JobStoreConfig) -> Result<Arc<dyn JobStore>, StoreError> {
    match config {
        JobStoreConfig::Memory { store_file } => {
            Ok(Arc::new(MemoryStore::open(store_file.as_deref())?))
        }
        JobStoreConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::open(path).await?)),
    }
}

/// Apply a stop event to a running job.
pub(crate) fn apply_stop(job: &mut Job, stop: StopJob) -> Result<(), StoreError> {
    if !job.is_running {
        return Err(StoreError::AlreadyStopped(job.id));
    }
    if stop.stop_time < job.start_time {
        return Err(JobValidationError::StopBeforeStart {
            id: job.id,
            start: job.start_time,
            stop: stop.stop_time,
        }
        .into());
    }
    job.is_running = false;
    job.stop_time = stop.stop_time;
    job.exit_code = stop.exit_code;
    Ok(())
}

/// Whether `text` contains `term`, ignoring case.
pub(crate) fn contains_ignore_case(text: &str, term: &str) -> bool {
    text.to_lowercase().contains(&term.to_lowercase())
}
