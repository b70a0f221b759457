//! Client for a remote build service that tracks builds as jobs.
//!
//! The service itself lives elsewhere; this is the caller's side: submit a
//! build, then poll its status until it completes, fails or a deadline passes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{BuilderError, Result};
use crate::params::BuildRequest;

pub const DEFAULT_BASE_URL: &str = "http://localhost:1025";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub task_status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

/// Anything that can report the status of a job.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusResponse>;
}

/// HTTP client of the build service.
#[derive(Debug, Clone)]
pub struct HttpJobStatusClient {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpJobStatusClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BuilderError::Config(format!("invalid base url '{base_url}': {e}")))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| BuilderError::JobStatus(format!("invalid endpoint '{path}': {e}")))
    }

    /// Submit a build. Returns the job id.
    pub async fn build_index(&self, request: &BuildRequest) -> Result<String> {
        let url = self.endpoint("/_build")?;
        let response = self.http.post(url).json(request).send().await?;
        let response = check_status(response).await?;
        let submitted: SubmitResponse = response.json().await?;
        info!(job_id = %submitted.job_id, "submitted index build");
        Ok(submitted.job_id)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let detail = response.text().await.unwrap_or_default();
    Err(BuilderError::JobStatus(format!("HTTP {status} from {url}: {detail}")))
}

#[async_trait]
impl JobStatusSource for HttpJobStatusClient {
    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusResponse> {
        let url = self.endpoint(&format!("/_status/{job_id}"))?;
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

/// Poll `job_id` every `interval` until it completes.
///
/// A failed job is a build error. Status requests that fail are retried
/// until `timeout` has passed, which is reported as a timeout.
pub async fn wait_for_job_completion(
    source: &dyn JobStatusSource,
    job_id: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<JobStatusResponse> {
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        if started.elapsed() > timeout {
            return Err(BuilderError::Timeout(format!(
                "job {job_id} did not complete within {}s",
                timeout.as_secs_f64()
            )));
        }

        attempts += 1;
        match source.get_job_status(job_id).await {
            Ok(response) => match response.task_status {
                JobStatus::Completed => {
                    info!(job_id, attempts, "job completed");
                    return Ok(response);
                }
                JobStatus::Failed => {
                    let reason = response
                        .error_message
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(BuilderError::Build(format!("job {job_id} failed: {reason}")));
                }
                JobStatus::Running => {
                    debug!(job_id, attempts, "job still running");
                }
            },
            Err(e) => {
                warn!(job_id, attempts, error = %e, "error checking job status, retrying");
            }
        }

        tokio::time::sleep(interval).await;
    }
}
