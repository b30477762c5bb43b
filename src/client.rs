//! HTTP client for the daemon, and write-route resolution for the CLI.
//!
//! The CLI talks to a running daemon when it can. When the daemon is not
//! reachable, or `--offline` is given, the same operation runs in-process
//! through [`crate::fallback`] under the shared workspace lock.
//!
//! `client.timeout_ms` bounds connecting, the health check and reads. Writes
//! (batches, rebuilds, job runs) have no overall deadline: they wait for the
//! write section and then run to completion, and giving up early would only
//! hide an outcome the daemon commits anyway.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::artifact::ArtifactEntry;
use crate::config::Config;
use crate::error::ErrorDetail;
use crate::index::RebuildReport;
use crate::jobs::{ArtifactPackConfig, Job, JobRun, NewJob};
use crate::models::{EventRecord, IngestBatch, IngestResult};
use crate::search::{SearchHit, SearchQuery};
use crate::server::{Deleted, HealthResponse, Items, RebuildRequest, SearchParams};

#[derive(Debug, Error)]
pub enum ClientError {
    /// No daemon answered: connection refused, timed out, or reset.
    #[error("daemon unreachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The daemon answered with an error body.
    #[error("daemon returned {status}: [{}] {}", error.code, error.message)]
    Api { status: StatusCode, error: ErrorDetail },

    #[error("unexpected daemon response: {0}")]
    Protocol(#[source] reqwest::Error),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    base_url: String,
    http: reqwest::Client,
    /// Per-request deadline for reads.
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(ClientError::Protocol)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        Self::new(&config.endpoint(), config.client_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn read(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path)).timeout(self.timeout)
    }

    fn write(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                ClientError::Unreachable {
                    url: self.base_url.clone(),
                    source: e,
                }
            } else {
                ClientError::Protocol(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(e) => ErrorDetail::new("http", e.to_string()),
            };
            return Err(ClientError::Api { status, error });
        }
        response.json::<T>().await.map_err(ClientError::Protocol)
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.send(self.read("/health")).await
    }

    pub async fn ingest(&self, events: Vec<Value>) -> Result<IngestResult, ClientError> {
        let body = IngestBatch { events };
        self.send(self.write(Method::POST, "/v1/events:batch").json(&body))
            .await
    }

    pub async fn get_event(&self, id: i64) -> Result<EventRecord, ClientError> {
        self.send(self.read(&format!("/v1/events/{}", id))).await
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, ClientError> {
        let params = SearchParams::from(query);
        let items: Items<SearchHit> = self
            .send(self.read("/v1/search").query(&params))
            .await?;
        Ok(items.items)
    }

    pub async fn rebuild(&self, wipe: bool) -> Result<RebuildReport, ClientError> {
        self.send(
            self.write(Method::POST, "/v1/index:rebuild")
                .json(&RebuildRequest { wipe }),
        )
        .await
    }

    pub async fn add_job(&self, job: &NewJob) -> Result<Job, ClientError> {
        self.send(self.write(Method::POST, "/v1/jobs").json(job)).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, ClientError> {
        let items: Items<Job> = self.send(self.read("/v1/jobs")).await?;
        Ok(items.items)
    }

    pub async fn get_job(&self, name: &str) -> Result<Job, ClientError> {
        self.send(self.read(&format!("/v1/jobs/{}", name))).await
    }

    pub async fn delete_job(&self, name: &str) -> Result<(), ClientError> {
        let _: Deleted = self
            .send(self.write(Method::DELETE, &format!("/v1/jobs/{}", name)))
            .await?;
        Ok(())
    }

    pub async fn run_job(&self, name: &str) -> Result<JobRun, ClientError> {
        self.send(self.write(Method::POST, &format!("/v1/jobs/{}/run", name)))
            .await
    }

    pub async fn list_runs(&self, name: &str, limit: i64) -> Result<Vec<JobRun>, ClientError> {
        let items: Items<JobRun> = self
            .send(
                self.read(&format!("/v1/jobs/{}/runs", name))
                    .query(&[("limit", limit)]),
            )
            .await?;
        Ok(items.items)
    }

    pub async fn artifacts(&self, limit: i64) -> Result<Vec<ArtifactEntry>, ClientError> {
        let items: Items<ArtifactEntry> = self
            .send(self.read("/v1/artifacts").query(&[("limit", limit)]))
            .await?;
        Ok(items.items)
    }

    pub async fn pack(&self, request: &ArtifactPackConfig) -> Result<JobRun, ClientError> {
        self.send(self.write(Method::POST, "/v1/artifacts:pack").json(request))
            .await
    }
}

/// Where a CLI operation goes.
#[derive(Debug, Clone)]
pub enum Route {
    Daemon(DaemonClient),
    /// In-process, under the workspace lock.
    Fallback,
}

/// Picks the daemon if it answers `/health`, the fallback path otherwise.
pub async fn resolve_route(config: &Config, offline: bool) -> Route {
    if offline {
        return Route::Fallback;
    }
    let client = match DaemonClient::from_config(config) {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "could not build daemon client, using fallback");
            return Route::Fallback;
        }
    };
    match client.health().await {
        Ok(health) => {
            debug!(url = %client.base_url(), pid = health.pid, "using daemon");
            Route::Daemon(client)
        }
        Err(e) => {
            debug!(error = %e, "daemon not available, using fallback");
            Route::Fallback
        }
    }
}
