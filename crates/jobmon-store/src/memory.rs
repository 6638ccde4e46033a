//! In-memory job store with optional JSON persistence.

use crate::error::StoreError;
use crate::store::{JobStore, SessionStore, apply_stop, contains_ignore_case};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use jobmon_core::{Job, JobFilter, MetricSummary, StopJob, Tag};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use tokio::sync::Mutex;

/// Everything the memory store holds, as persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MemoryState {
    jobs: BTreeMap<i64, Job>,
    tags: BTreeMap<i64, Tag>,
    sessions: BTreeMap<String, String>,
    roles: BTreeMap<String, Vec<String>>,
}

impl MemoryState {
    fn job_mut(&mut self, id: i64) -> Result<&mut Job, StoreError> {
        self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    /// Registered tag for `tag`, creating it if needed.
    fn resolve_tag(&mut self, tag: Tag) -> Tag {
        if tag.id == 0 {
            if let Some(existing) = self
                .tags
                .values()
                .find(|t| t.name == tag.name && t.kind == tag.kind && t.created_by == tag.created_by)
            {
                return existing.clone();
            }
            let id = self.tags.keys().next_back().map_or(1, |last| last + 1);
            let tag = Tag { id, ..tag };
            self.tags.insert(id, tag.clone());
            return tag;
        }
        self.tags.entry(tag.id).or_insert(tag).clone()
    }

    /// Ids of tags attached to jobs of `user`, or to any job.
    fn used_tags(&self, user: Option<&str>) -> BTreeSet<i64> {
        self.jobs
            .values()
            .filter(|j| user.is_none_or(|u| j.user_name == u))
            .flat_map(|j| j.tags.iter().map(|t| t.id))
            .collect()
    }
}

/// Job store backed by a map behind a single mutex.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    path: Option<Utf8PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            path: None,
        }
    }

    /// Open a store persisted at `path`, loading its current content.
    ///
    /// A missing file yields an empty store; without a path nothing is
    /// persisted.
    pub fn open(path: Option<&Utf8Path>) -> Result<Self, StoreError> {
        let Some(path) = path else {
            return Ok(Self::new());
        };
        let state = load(path)?;
        tracing::info!(path = %path, jobs = state.jobs.len(), "Loaded job store");
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path.to_owned()),
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn io_error(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_owned(),
        source,
    }
}

fn load(path: &Utf8Path) -> Result<MemoryState, StoreError> {
    if !path.exists() {
        return Ok(MemoryState::default());
    }
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    Ok(serde_json::from_str(&content)?)
}

fn save(path: &Utf8Path, state: &MemoryState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
    }
    let content = serde_json::to_string_pretty(state)?;
    fs::write(path, content).map_err(io_error(path))?;
    Ok(())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn put_job(&self, job: Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        let mut job = job;
        let tags = std::mem::take(&mut job.tags);
        for tag in tags {
            let tag = state.resolve_tag(tag);
            job.add_tag(&tag);
        }
        state.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: i64) -> Result<Job, StoreError> {
        let state = self.state.lock().await;
        state.jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.values().cloned().collect())
    }

    async fn get_filtered_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }

    async fn mark_stopped(&self, id: i64, stop: StopJob) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        apply_stop(job, stop)?;
        Ok(job.clone())
    }

    async fn update_job(&self, job: Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state.job_mut(job.id)?;
        *slot = job;
        Ok(())
    }

    async fn set_summaries(
        &self,
        id: i64,
        summaries: Option<Vec<MetricSummary>>,
    ) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let slot = state.job_mut(id)?;
        slot.summaries = summaries;
        Ok(slot.clone())
    }

    async fn delete_job(&self, id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.jobs.remove(&id).is_some())
    }

    async fn add_tag(&self, id: i64, tag: Tag) -> Result<Tag, StoreError> {
        let mut state = self.state.lock().await;
        state.job_mut(id)?;
        let tag = state.resolve_tag(tag);
        state.job_mut(id)?.add_tag(&tag);
        Ok(tag)
    }

    async fn remove_tag(&self, id: i64, tag_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.job_mut(id)?.remove_tag(tag_id);
        Ok(())
    }

    async fn get_job_tags(&self, user: Option<&str>) -> Result<Vec<Tag>, StoreError> {
        let state = self.state.lock().await;
        let used = state.used_tags(user);
        Ok(used
            .iter()
            .filter_map(|id| state.tags.get(id))
            .cloned()
            .collect())
    }

    async fn search_tags(&self, term: &str, user: Option<&str>) -> Result<Vec<Tag>, StoreError> {
        let state = self.state.lock().await;
        let used = user.map(|u| state.used_tags(Some(u)));
        Ok(state
            .tags
            .values()
            .filter(|t| contains_ignore_case(&t.name, term))
            .filter(|t| used.as_ref().is_none_or(|ids| ids.contains(&t.id)))
            .cloned()
            .collect())
    }

    async fn users_with_jobs(&self, term: Option<&str>) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let users: BTreeSet<&str> = state
            .jobs
            .values()
            .map(|j| j.user_name.as_str())
            .filter(|u| term.is_none_or(|t| contains_ignore_case(u, t)))
            .collect();
        Ok(users.into_iter().map(str::to_string).collect())
    }

    async fn search_jobs(&self, term: &str, user: Option<&str>) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| user.is_none_or(|u| j.user_name == u))
            .filter(|j| {
                j.id.to_string().contains(term)
                    || contains_ignore_case(&j.job_name, term)
                    || contains_ignore_case(&j.account, term)
            })
            .cloned()
            .collect())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let state = self.state.lock().await;
        save(path, &state)?;
        tracing::info!(path = %path, jobs = state.jobs.len(), "Saved job store");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_session_token(&self, user: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.sessions.get(user).cloned())
    }

    async fn set_session_token(&self, user: &str, token: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.sessions.insert(user.to_string(), token.to_string());
        Ok(())
    }

    async fn remove_session(&self, user: &str) -> Result<(), StoreError> {
        self.state.lock().await.sessions.remove(user);
        Ok(())
    }

    async fn get_user_roles(&self, user: &str) -> Result<Option<Vec<String>>, StoreError> {
        Ok(self.state.lock().await.roles.get(user).cloned())
    }

    async fn set_user_roles(&self, user: &str, roles: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.roles.insert(user.to_string(), roles.to_vec());
        Ok(())
    }
}
