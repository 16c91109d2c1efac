//! Worker loop: pull jobs, run the handler, post results.
//!
//! Two sources ship with the worker:
//! - `HttpJobSource` polls the platform's job webhook
//!   (`RUNPOD_WEBHOOK_GET_JOB`) and posts to `RUNPOD_WEBHOOK_POST_OUTPUT`;
//!   `$ID` in those URLs is replaced by the worker id and the job id.
//! - `FileJobSource` runs the single job in `test_input.json` and stops.
//!
//! A failed job never stops the loop; only shutdown or a closed source does.

use crate::error::{Result, SynthesisError};
use crate::handler::{JobHandler, JobResponse};
use crate::request::Job;
use crate::utils::{env_parse, env_string};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of asking a source for work.
#[derive(Debug)]
pub enum JobPoll {
    Ready(Job),
    /// Nothing queued right now
    Empty,
    /// The source will never produce another job
    Closed,
}

#[async_trait]
pub trait JobSource: Send + Sync {
    async fn next_job(&self) -> Result<JobPoll>;
    async fn complete(&self, job_id: &str, response: &JobResponse) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub get_job_url: Option<String>,
    pub post_output_url: Option<String>,
    pub api_key: Option<String>,
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub test_input: PathBuf,
    pub metrics_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            get_job_url: env_string("RUNPOD_WEBHOOK_GET_JOB"),
            post_output_url: env_string("RUNPOD_WEBHOOK_POST_OUTPUT"),
            api_key: env_string("RUNPOD_AI_API_KEY"),
            worker_id: env_string("RUNPOD_POD_ID").unwrap_or_else(|| "local-worker".to_string()),
            poll_interval_ms: env_parse("JOB_POLL_INTERVAL_MS").unwrap_or(1_000),
            request_timeout_ms: env_parse("JOB_REQUEST_TIMEOUT_MS").unwrap_or(90_000),
            test_input: env_string("TEST_INPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("test_input.json")),
            metrics_interval_secs: env_parse("METRICS_INTERVAL_SECS").unwrap_or(300),
        }
    }
}

impl RuntimeConfig {
    pub fn has_webhooks(&self) -> bool {
        self.get_job_url.is_some() && self.post_output_url.is_some()
    }
}

pub struct HttpJobSource {
    get_job_url: String,
    post_output_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpJobSource {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let (Some(get_url), Some(post_url)) = (&config.get_job_url, &config.post_output_url) else {
            return Err(SynthesisError::Internal(
                "RUNPOD_WEBHOOK_GET_JOB and RUNPOD_WEBHOOK_POST_OUTPUT must both be set".into(),
            ));
        };
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SynthesisError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            get_job_url: get_url.replace("$ID", &config.worker_id),
            post_output_url: post_url.clone(),
            api_key: config.api_key.clone(),
            http_client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(reqwest::header::AUTHORIZATION, key),
            None => request,
        }
    }
}

#[async_trait]
impl JobSource for HttpJobSource {
    async fn next_job(&self) -> Result<JobPoll> {
        let response = self
            .authorize(self.http_client.get(&self.get_job_url))
            .send()
            .await
            .map_err(|e| SynthesisError::Internal(format!("job poll failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(JobPoll::Empty);
        }
        if !status.is_success() {
            return Err(SynthesisError::Internal(format!("job poll returned {}", status)));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| SynthesisError::Internal(format!("job poll body: {}", e)))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(JobPoll::Empty);
        }
        let job: Job = serde_json::from_slice(&body)?;
        debug!(target: "runtime", job_id = ?job.id, "Received job");
        Ok(JobPoll::Ready(job))
    }

    async fn complete(&self, job_id: &str, response: &JobResponse) -> Result<()> {
        let url = self.post_output_url.replace("$ID", job_id);
        let body = match response {
            JobResponse::Failed(failed) => serde_json::json!({
                "error": failed.error,
                "output": response.to_value(),
            }),
            _ => serde_json::json!({ "output": response.to_value() }),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let sent = self
                .authorize(self.http_client.post(&url))
                .json(&body)
                .send()
                .await;
            match sent {
                Ok(r) if r.status().is_success() => return Ok(()),
                Ok(r) if attempt < 3 && r.status().is_server_error() => {
                    warn!(target: "runtime", job_id = %job_id, status = %r.status(), attempt, "Posting result failed, retrying");
                }
                Ok(r) => {
                    return Err(SynthesisError::Internal(format!(
                        "posting result returned {}",
                        r.status()
                    )))
                }
                Err(e) if attempt < 3 => {
                    warn!(target: "runtime", job_id = %job_id, error = %e, attempt, "Posting result failed, retrying");
                }
                Err(e) => {
                    return Err(SynthesisError::Internal(format!("posting result failed: {}", e)))
                }
            }
            tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
        }
    }
}

/// One-shot source for local runs: the job in a JSON file.
pub struct FileJobSource {
    path: PathBuf,
    taken: Mutex<bool>,
    output: Mutex<Option<serde_json::Value>>,
}

impl FileJobSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            taken: Mutex::new(false),
            output: Mutex::new(None),
        }
    }

    /// Response of the job once it completed.
    pub fn output(&self) -> Option<serde_json::Value> {
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl JobSource for FileJobSource {
    async fn next_job(&self) -> Result<JobPoll> {
        {
            let mut taken = self.taken.lock().unwrap_or_else(|p| p.into_inner());
            if *taken {
                return Ok(JobPoll::Closed);
            }
            *taken = true;
        }
        let raw = tokio::fs::read(&self.path).await?;
        let mut job: Job = serde_json::from_slice(&raw)?;
        if job.id.is_none() {
            job.id = Some("local_test".to_string());
        }
        info!(target: "runtime", path = ?self.path, "Running local test job");
        Ok(JobPoll::Ready(job))
    }

    async fn complete(&self, job_id: &str, response: &JobResponse) -> Result<()> {
        let value = response.to_value();
        info!(target: "runtime", job_id = %job_id, success = response.is_success(), "Local job finished");
        *self.output.lock().unwrap_or_else(|p| p.into_inner()) = Some(value);
        Ok(())
    }
}

/// Serve jobs until the source closes or `shutdown` flips to `true`.
/// A job in progress when shutdown arrives is finished and reported.
/// Returns the number of jobs handled.
pub async fn run_worker(
    source: &dyn JobSource,
    handler: &JobHandler,
    config: &RuntimeConfig,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let metrics_interval = Duration::from_secs(config.metrics_interval_secs.max(1));
    let mut last_report = Instant::now();
    let mut handled = 0u64;
    let mut consecutive_errors = 0u32;

    info!(target: "runtime", worker_id = %config.worker_id, "Worker loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = source.next_job() => polled,
        };

        let idle = match polled {
            Ok(JobPoll::Ready(job)) => {
                consecutive_errors = 0;
                let response = handler.handle(job).await;
                if let Err(e) = source.complete(response.job_id(), &response).await {
                    error!(target: "runtime", job_id = %response.job_id(), error = %e, "Could not report job result");
                }
                handled += 1;
                None
            }
            Ok(JobPoll::Empty) => {
                consecutive_errors = 0;
                Some(poll_interval)
            }
            Ok(JobPoll::Closed) => break,
            Err(e) => {
                consecutive_errors += 1;
                warn!(target: "runtime", error = %e, consecutive_errors, "Fetching next job failed");
                Some(poll_interval * consecutive_errors.min(10))
            }
        };

        if last_report.elapsed() >= metrics_interval {
            handler.metrics().print_metrics().await;
            last_report = Instant::now();
        }

        if let Some(wait) = idle {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    info!(target: "runtime", handled, "Worker loop stopped");
    handler.metrics().print_metrics().await;
    handled
}
