//! In-memory [`FluxBackend`] for tests of the crates built on top of it.

use crate::client::{Bucket, FluxBackend, Organization, Task};
use crate::error::FluxError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Answers queries with canned annotated CSV and records every call.
///
/// A query is answered by the first registered response whose needle it
/// contains, or with an empty result.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    responses: Vec<(String, String)>,
    failures: Vec<String>,
    unreachable: bool,
    queries: Mutex<Vec<String>>,
    tasks: Mutex<Vec<Task>>,
    runs: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, needle: &str, csv: impl Into<String>) -> Self {
        self.responses.push((needle.to_string(), csv.into()));
        self
    }

    /// Fail every query containing `needle`.
    pub fn with_failure(mut self, needle: &str) -> Self {
        self.failures.push(needle.to_string());
        self
    }

    /// Fail connectivity checks.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn with_task(mut self, name: &str) -> Self {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.get_mut().push(Task {
            id: format!("t{id}"),
            name: name.to_string(),
            org_id: "org".to_string(),
            every: Some("1m".to_string()),
            status: Some("active".to_string()),
        });
        self
    }

    pub async fn queries(&self) -> Vec<String> {
        self.queries.lock().await.clone()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().await.clone()
    }

    /// Ids of tasks that were run manually, in call order.
    pub async fn runs(&self) -> Vec<String> {
        self.runs.lock().await.clone()
    }

    fn check_reachable(&self) -> Result<(), FluxError> {
        if self.unreachable {
            return Err(FluxError::QueryError("backend unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FluxBackend for MemoryBackend {
    async fn ping(&self) -> Result<(), FluxError> {
        self.check_reachable()
    }

    async fn find_organization(&self, name: &str) -> Result<Organization, FluxError> {
        self.check_reachable()?;
        Ok(Organization {
            id: "org".to_string(),
            name: name.to_string(),
        })
    }

    async fn find_bucket(&self, name: &str) -> Result<Bucket, FluxError> {
        self.check_reachable()?;
        Ok(Bucket {
            id: "bucket".to_string(),
            name: name.to_string(),
            org_id: "org".to_string(),
        })
    }

    async fn query_raw(&self, flux: &str) -> Result<String, FluxError> {
        self.queries.lock().await.push(flux.to_string());
        self.check_reachable()?;
        if self.failures.iter().any(|needle| flux.contains(needle.as_str())) {
            return Err(FluxError::QueryError("injected failure".to_string()));
        }
        Ok(self
            .responses
            .iter()
            .find(|(needle, _)| flux.contains(needle.as_str()))
            .map(|(_, csv)| csv.clone())
            .unwrap_or_default())
    }

    async fn find_tasks(&self) -> Result<Vec<Task>, FluxError> {
        self.check_reachable()?;
        Ok(self.tasks.lock().await.clone())
    }

    async fn create_task(
        &self,
        name: &str,
        _flux: &str,
        every: &str,
        org_id: &str,
    ) -> Result<Task, FluxError> {
        self.check_reachable()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            id: format!("t{id}"),
            name: name.to_string(),
            org_id: org_id.to_string(),
            every: Some(every.to_string()),
            status: Some("active".to_string()),
        };
        self.tasks.lock().await.push(task.clone());
        Ok(task)
    }

    async fn run_task(&self, task: &Task) -> Result<(), FluxError> {
        self.check_reachable()?;
        self.runs.lock().await.push(task.id.clone());
        Ok(())
    }
}

/// Annotated CSV with one `_value` series per `(key, time, value)` row,
/// grouped into one table per distinct key.
pub fn series_csv(key_column: &str, rows: &[(&str, &str, f64)]) -> String {
    let mut out = format!(
        "#datatype,string,long,dateTime:RFC3339,double,string\n\
         #group,false,false,false,false,true\n\
         #default,_result,,,,\n\
         ,result,table,_time,_value,{key_column}\n"
    );
    let mut keys: Vec<&str> = Vec::new();
    for (key, time, value) in rows {
        let table = match keys.iter().position(|k| k == key) {
            Some(i) => i,
            None => {
                keys.push(*key);
                keys.len() - 1
            }
        };
        out.push_str(&format!(",,{table},{time},{value},{key}\n"));
    }
    out
}

/// Annotated CSV shaped like the answer to a metadata query.
pub fn metadata_csv(mean: f64, max: f64) -> String {
    format!(
        "#datatype,string,long,string,double\n\
         #group,false,false,true,false\n\
         #default,_result,,,\n\
         ,result,table,_field,_value\n\
         ,,0,mean,{mean}\n\
         ,,1,max,{max}\n"
    )
}
