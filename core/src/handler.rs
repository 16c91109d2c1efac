//! Job handler: the serverless entry point
//!
//! Every job ends in exactly one `JobResponse`. Synthesis runs in its own
//! task under the execution window, so a timeout or a panic inside a model
//! adapter becomes a classified failure and the worker keeps serving.

use crate::audio::OutputFormat;
use crate::error::{ErrorKind, Result, SynthesisError};
use crate::language::Language;
use crate::pipeline::{PipelineInput, StageTimings, SynthesisPipeline};
use crate::request::{Job, JobAction, JobInput, RequestPolicy, SynthesisRequest};
use crate::storage::{object_key, ObjectStorage};
use crate::telemetry::JobMetrics;
use crate::utils::{gen_job_id, preview};
use crate::voice::{StoredVoice, VoiceRegistry};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Where finished audio goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Base64 in the response
    Inline,
    /// Object storage; the response carries the URL
    Upload,
    /// Upload when storage is configured, inline otherwise
    #[default]
    Auto,
}

impl std::str::FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(OutputMode::Inline),
            "upload" => Ok(OutputMode::Upload),
            "auto" => Ok(OutputMode::Auto),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub execution_timeout_ms: u64,
    pub output_mode: OutputMode,
    pub policy: RequestPolicy,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 300_000,
            output_mode: OutputMode::Auto,
            policy: RequestPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedSynthesis {
    pub status: JobStatus,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    pub format: OutputFormat,
    pub language: Language,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_language: Option<String>,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub model: String,
    pub voice_profile_id: Option<String>,
    /// Registry voice the job named, echoed for correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_voice_id: Option<String>,
    pub converted: bool,
    pub timings_ms: StageTimings,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum VoiceResult {
    Voice {
        voice: StoredVoice,
    },
    Voices {
        user_id: String,
        voices: Vec<StoredVoice>,
    },
    Deleted {
        voice_profile_id: String,
        deleted: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceOutcome {
    pub status: JobStatus,
    pub job_id: String,
    #[serde(flatten)]
    pub result: VoiceResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub status: JobStatus,
    pub job_id: String,
    pub error: String,
    pub error_kind: ErrorKind,
    pub retryable: bool,
}

impl FailedJob {
    pub fn new(job_id: &str, error: &SynthesisError) -> Self {
        Self {
            status: JobStatus::Failed,
            job_id: job_id.to_string(),
            error: error.to_string(),
            error_kind: error.kind(),
            retryable: error.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobResponse {
    Synthesis(Box<CompletedSynthesis>),
    Voice(VoiceOutcome),
    Failed(FailedJob),
}

impl JobResponse {
    pub fn job_id(&self) -> &str {
        match self {
            JobResponse::Synthesis(s) => &s.job_id,
            JobResponse::Voice(v) => &v.job_id,
            JobResponse::Failed(f) => &f.job_id,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, JobResponse::Failed(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            JobResponse::Failed(f) => Some(f.error_kind),
            _ => None,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "status": "failed",
                "job_id": self.job_id(),
                "error": format!("response serialization failed: {}", e),
                "error_kind": "internal",
                "retryable": false,
            })
        })
    }
}

/// Resolved destination for finished audio.
#[derive(Clone)]
enum AudioSink {
    Inline,
    Upload {
        storage: Arc<dyn ObjectStorage>,
        prefix: String,
    },
    Unavailable,
}

pub struct JobHandler {
    pipeline: Arc<SynthesisPipeline>,
    registry: Option<Arc<VoiceRegistry>>,
    sink: AudioSink,
    metrics: Arc<JobMetrics>,
    config: HandlerConfig,
}

impl JobHandler {
    pub fn new(pipeline: Arc<SynthesisPipeline>, config: HandlerConfig) -> Self {
        let sink = match config.output_mode {
            OutputMode::Upload => AudioSink::Unavailable,
            OutputMode::Inline | OutputMode::Auto => AudioSink::Inline,
        };
        Self {
            pipeline,
            registry: None,
            sink,
            metrics: Arc::new(JobMetrics::new()),
            config,
        }
    }

    pub fn with_registry(mut self, registry: Arc<VoiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attach object storage; ignored when the output mode is `inline`.
    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>, prefix: impl Into<String>) -> Self {
        if self.config.output_mode != OutputMode::Inline {
            self.sink = AudioSink::Upload {
                storage,
                prefix: prefix.into(),
            };
        }
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<JobMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<JobMetrics> {
        &self.metrics
    }

    pub fn pipeline(&self) -> &Arc<SynthesisPipeline> {
        &self.pipeline
    }

    #[tracing::instrument(skip(self, job), fields(job_id = tracing::field::Empty))]
    pub async fn handle(&self, job: Job) -> JobResponse {
        let job_id = job
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(gen_job_id);
        tracing::Span::current().record("job_id", job_id.as_str());
        let start = Instant::now();

        let response = match self.dispatch(&job_id, &job.input).await {
            Ok(response) => response,
            Err(e) => {
                if e.kind() == ErrorKind::Internal {
                    error!(target: "handler", job_id = %job_id, error = %e, "Job failed");
                } else {
                    warn!(target: "handler", job_id = %job_id, kind = %e.kind(), error = %e, "Job failed");
                }
                JobResponse::Failed(FailedJob::new(&job_id, &e))
            }
        };

        self.metrics
            .record_job(start.elapsed(), response.error_kind())
            .await;
        response
    }

    fn registry(&self) -> Result<&Arc<VoiceRegistry>> {
        self.registry.as_ref().ok_or_else(|| {
            SynthesisError::Validation("voice registry is not available on this worker".into())
        })
    }

    async fn dispatch(&self, job_id: &str, raw: &serde_json::Value) -> Result<JobResponse> {
        let input = JobInput::from_value(raw)?;
        let policy = &self.config.policy;
        let not_found = |id: &str| SynthesisError::Validation(format!("voice '{}' not found", id));

        let result = match input.action()? {
            JobAction::Synthesize => return self.synthesize(job_id, &input).await,
            JobAction::CreateVoice => VoiceResult::Voice {
                voice: self.registry()?.create(input.new_voice(policy)?).await?,
            },
            JobAction::GetVoice => {
                let id = input.profile_id()?;
                VoiceResult::Voice {
                    voice: self.registry()?.get(id).await.ok_or_else(|| not_found(id))?,
                }
            }
            JobAction::ListVoices => {
                let user_id = input.owner()?;
                VoiceResult::Voices {
                    user_id: user_id.to_string(),
                    voices: self.registry()?.list_for_user(user_id).await,
                }
            }
            JobAction::UpdateVoice => {
                let id = input.profile_id()?;
                let update = input.voice_update(policy)?;
                VoiceResult::Voice {
                    voice: self
                        .registry()?
                        .update(id, update)
                        .await?
                        .ok_or_else(|| not_found(id))?,
                }
            }
            JobAction::DeleteVoice => {
                let id = input.profile_id()?;
                VoiceResult::Deleted {
                    voice_profile_id: id.to_string(),
                    deleted: self.registry()?.delete(id).await?,
                }
            }
        };
        info!(target: "handler", job_id = %job_id, "Voice registry job done");
        Ok(JobResponse::Voice(VoiceOutcome {
            status: JobStatus::Completed,
            job_id: job_id.to_string(),
            result,
        }))
    }

    async fn synthesize(&self, job_id: &str, input: &JobInput) -> Result<JobResponse> {
        let request = SynthesisRequest::from_input(job_id, input, &self.config.policy)?;
        info!(
            target: "handler",
            job_id = %job_id,
            language = %request.language,
            cloned = request.voice.is_some() || request.voice_profile_id.is_some(),
            mode = request.mode.as_str(),
            text = %preview(&request.text, 60),
            "Synthesis job accepted"
        );

        let limit_ms = self.config.execution_timeout_ms;
        let task = tokio::spawn(run_synthesis(
            Arc::clone(&self.pipeline),
            self.registry.clone(),
            self.sink.clone(),
            request,
        ));
        let abort = task.abort_handle();

        match tokio::time::timeout(Duration::from_millis(limit_ms), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(SynthesisError::Internal(format!("synthesis task panicked: {}", message)))
            }
            Ok(Err(_)) => Err(SynthesisError::Internal("synthesis task was cancelled".into())),
            Err(_) => {
                abort.abort();
                warn!(target: "handler", job_id = %job_id, limit_ms, "Execution window exceeded; job aborted");
                Err(SynthesisError::Timeout(limit_ms))
            }
        }
    }
}

async fn run_synthesis(
    pipeline: Arc<SynthesisPipeline>,
    registry: Option<Arc<VoiceRegistry>>,
    sink: AudioSink,
    mut request: SynthesisRequest,
) -> Result<JobResponse> {
    if let Some(id) = &request.voice_profile_id {
        let registry = registry.ok_or_else(|| {
            SynthesisError::Validation("voice registry is not available on this worker".into())
        })?;
        let stored = registry
            .get(id)
            .await
            .ok_or_else(|| SynthesisError::Validation(format!("voice '{}' not found", id)))?;
        request.voice = Some(stored.reference());
    }

    let output = pipeline
        .run(&PipelineInput {
            job_id: request.job_id.clone(),
            text: request.text.clone(),
            language: request.language,
            voice: request.voice.clone(),
            mode: request.mode,
            format: request.format,
        })
        .await?;

    let format = output.audio.format;
    let (audio_url, audio_base64) = match &sink {
        AudioSink::Inline => (
            None,
            Some(base64::engine::general_purpose::STANDARD.encode(&output.audio.bytes)),
        ),
        AudioSink::Upload { storage, prefix } => {
            let key = object_key(prefix, &request.job_id, format.extension());
            let url = storage
                .upload(&key, output.audio.bytes, format.content_type())
                .await?;
            (Some(url), None)
        }
        AudioSink::Unavailable => {
            return Err(SynthesisError::Storage(
                "upload output requested but object storage is not configured".into(),
            ))
        }
    };

    Ok(JobResponse::Synthesis(Box::new(CompletedSynthesis {
        status: JobStatus::Completed,
        job_id: request.job_id,
        audio_url,
        audio_base64,
        format,
        language: output.language,
        requested_language: request.requested_language,
        duration_seconds: output.audio.duration_secs,
        sample_rate: output.audio.sample_rate,
        model: output.model,
        voice_profile_id: output.voice_profile_id,
        registry_voice_id: request.voice_profile_id,
        converted: output.converted,
        timings_ms: output.timings,
    })))
}
