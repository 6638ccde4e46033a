//! InfluxDB v2 HTTP client.

use crate::csv::parse_annotated_csv;
use crate::error::FluxError;
use crate::query::task_definition;
use async_trait::async_trait;
use jobmon_core::QueryResult;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

/// A scheduled task registered on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(rename = "orgID", default)]
    pub org_id: String,
    #[serde(default)]
    pub every: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(rename = "orgID", default)]
    pub org_id: String,
}

/// Operations the engine needs from a time-series backend.
#[async_trait]
pub trait FluxBackend: Send + Sync {
    async fn ping(&self) -> Result<(), FluxError>;

    async fn find_organization(&self, name: &str) -> Result<Organization, FluxError>;

    async fn find_bucket(&self, name: &str) -> Result<Bucket, FluxError>;

    /// Run a Flux query and return the annotated CSV as-is.
    async fn query_raw(&self, flux: &str) -> Result<String, FluxError>;

    /// Run a Flux query and parse the result records.
    async fn query(&self, flux: &str) -> Result<Vec<QueryResult>, FluxError> {
        let raw = self.query_raw(flux).await?;
        parse_annotated_csv(&raw)
    }

    async fn find_tasks(&self) -> Result<Vec<Task>, FluxError>;

    async fn create_task(
        &self,
        name: &str,
        flux: &str,
        every: &str,
        org_id: &str,
    ) -> Result<Task, FluxError>;

    /// Trigger a manual run of `task`.
    async fn run_task(&self, task: &Task) -> Result<(), FluxError>;
}

#[derive(Deserialize)]
struct Orgs {
    #[serde(default)]
    orgs: Vec<Organization>,
}

#[derive(Deserialize)]
struct Buckets {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

#[derive(Deserialize)]
struct Tasks {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// [`FluxBackend`] over the InfluxDB v2 HTTP API.
#[derive(Debug, Clone)]
pub struct InfluxClient {
    http: Client,
    base: String,
    token: String,
    org: String,
}

impl InfluxClient {
    pub fn new(host: &str, token: &str, org: &str, timeout: Duration) -> Result<Self, FluxError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| FluxError::RequestError {
                url: host.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base: host.trim_end_matches('/').to_string(),
            token: token.to_string(),
            org: org.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, url: &str, req: RequestBuilder) -> Result<Response, FluxError> {
        let response = req
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .send()
            .await
            .map_err(|source| FluxError::RequestError {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FluxError::StatusError {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FluxError> {
        let url = self.url(path);
        let response = self.send(&url, self.http.get(&url).query(query)).await?;
        response
            .json()
            .await
            .map_err(|source| FluxError::RequestError { url, source })
    }
}

#[async_trait]
impl FluxBackend for InfluxClient {
    async fn ping(&self) -> Result<(), FluxError> {
        let url = self.url("/ping");
        self.send(&url, self.http.get(&url)).await?;
        Ok(())
    }

    async fn find_organization(&self, name: &str) -> Result<Organization, FluxError> {
        let orgs: Orgs = self.get_json("/api/v2/orgs", &[("org", name)]).await?;
        orgs.orgs
            .into_iter()
            .find(|o| o.name == name)
            .ok_or_else(|| FluxError::NotFound {
                kind: "organization",
                name: name.to_string(),
            })
    }

    async fn find_bucket(&self, name: &str) -> Result<Bucket, FluxError> {
        let buckets: Buckets = self
            .get_json("/api/v2/buckets", &[("name", name), ("org", self.org.as_str())])
            .await?;
        buckets
            .buckets
            .into_iter()
            .find(|b| b.name == name)
            .ok_or_else(|| FluxError::NotFound {
                kind: "bucket",
                name: name.to_string(),
            })
    }

    async fn query_raw(&self, flux: &str) -> Result<String, FluxError> {
        let url = self.url("/api/v2/query");
        let body = json!({
            "query": flux,
            "type": "flux",
            "dialect": {
                "header": true,
                "delimiter": ",",
                "annotations": ["datatype", "group", "default"],
            },
        });
        let req = self
            .http
            .post(&url)
            .query(&[("org", self.org.as_str())])
            .header(ACCEPT, "application/csv")
            .header(CONTENT_TYPE, "application/json")
            .json(&body);

        let started = Instant::now();
        let response = self.send(&url, req).await?;
        let text = response
            .text()
            .await
            .map_err(|source| FluxError::RequestError { url, source })?;
        tracing::debug!(elapsed = ?started.elapsed(), bytes = text.len(), "Flux query finished");
        Ok(text)
    }

    async fn find_tasks(&self) -> Result<Vec<Task>, FluxError> {
        let tasks: Tasks = self
            .get_json("/api/v2/tasks", &[("org", self.org.as_str()), ("limit", "500")])
            .await?;
        Ok(tasks.tasks)
    }

    async fn create_task(
        &self,
        name: &str,
        flux: &str,
        every: &str,
        org_id: &str,
    ) -> Result<Task, FluxError> {
        let url = self.url("/api/v2/tasks");
        let body = json!({
            "orgID": org_id,
            "status": "active",
            "flux": task_definition(name, every, flux),
        });
        let response = self.send(&url, self.http.post(&url).json(&body)).await?;
        response
            .json()
            .await
            .map_err(|source| FluxError::RequestError { url, source })
    }

    async fn run_task(&self, task: &Task) -> Result<(), FluxError> {
        let url = self.url(&format!("/api/v2/tasks/{}/runs", task.id));
        self.send(&url, self.http.post(&url).json(&json!({}))).await?;
        Ok(())
    }
}
