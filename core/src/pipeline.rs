//! Synthesis pipeline
//!
//! One job moves through
//! `Validated -> VoiceResolved? -> Generated -> Converted? -> Encoded -> Done`,
//! with `Failed` reachable from every non-terminal stage. Each transition is
//! logged with the time spent in the stage it leaves.

use crate::audio::{AudioEncoder, EncodedAudio, OutputFormat};
use crate::error::{Result, SynthesisError};
use crate::language::Language;
use crate::models::ModelPool;
use crate::text;
use crate::utils::{elapsed_ms, preview};
use crate::voice::{CloneMode, VoiceProfile, VoiceProfileCache, VoiceReference};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validated,
    VoiceResolved,
    Generated,
    Converted,
    Encoded,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validated => "validated",
            Stage::VoiceResolved => "voice_resolved",
            Stage::Generated => "generated",
            Stage::Converted => "converted",
            Stage::Encoded => "encoded",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    pub fn can_advance_to(&self, next: Stage) -> bool {
        use Stage::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Validated, VoiceResolved)
                | (Validated, Generated)
                | (VoiceResolved, Generated)
                | (Generated, Converted)
                | (Generated, Encoded)
                | (Converted, Encoded)
                | (Encoded, Done)
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milliseconds spent reaching each stage, plus `total`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StageTimings(BTreeMap<String, u64>);

impl StageTimings {
    pub fn get(&self, stage: &str) -> Option<u64> {
        self.0.get(stage).copied()
    }

    pub fn total_ms(&self) -> u64 {
        self.get("total").unwrap_or(0)
    }

    pub(crate) fn record(&mut self, stage: &str, ms: u64) {
        *self.0.entry(stage.to_string()).or_insert(0) += ms;
    }
}

/// Tracks the current stage of one run and enforces legal transitions.
struct StageTracker<'a> {
    job_id: &'a str,
    stage: Stage,
    started: Instant,
    entered: Instant,
    timings: StageTimings,
}

impl<'a> StageTracker<'a> {
    fn new(job_id: &'a str) -> Self {
        let now = Instant::now();
        Self {
            job_id,
            stage: Stage::Validated,
            started: now,
            entered: now,
            timings: StageTimings::default(),
        }
    }

    fn advance(&mut self, next: Stage) -> Result<()> {
        if !self.stage.can_advance_to(next) {
            return Err(SynthesisError::Internal(format!(
                "illegal pipeline transition {} -> {}",
                self.stage, next
            )));
        }
        let spent = elapsed_ms(self.entered);
        self.timings.record(next.as_str(), spent);
        debug!(
            target: "pipeline",
            job_id = %self.job_id,
            from = %self.stage,
            to = %next,
            elapsed_ms = spent,
            "Stage transition"
        );
        self.stage = next;
        self.entered = Instant::now();
        Ok(())
    }

    fn fail(&mut self, error: &SynthesisError) {
        if self.stage.is_terminal() {
            return;
        }
        warn!(
            target: "pipeline",
            job_id = %self.job_id,
            stage = %self.stage,
            kind = %error.kind(),
            error = %error,
            elapsed_ms = elapsed_ms(self.started),
            "Pipeline failed"
        );
        self.stage = Stage::Failed;
    }

    fn finish(mut self) -> StageTimings {
        self.timings.record("total", elapsed_ms(self.started));
        self.timings
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fail the job when tone-color conversion fails instead of returning
    /// the unconverted audio
    pub strict_conversion: bool,
    /// Loudness target applied before encoding; `None` leaves levels alone
    pub target_rms: Option<f32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strict_conversion: false,
            target_rms: Some(0.1),
        }
    }
}

/// What the pipeline is asked to produce. Language and voice are already
/// validated and resolved by the caller.
#[derive(Debug, Clone)]
pub struct PipelineInput {
    pub job_id: String,
    pub text: String,
    pub language: Language,
    pub voice: Option<VoiceReference>,
    pub mode: CloneMode,
    pub format: OutputFormat,
}

#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub audio: EncodedAudio,
    pub language: Language,
    pub voice_profile_id: Option<String>,
    pub converted: bool,
    pub model: String,
    pub timings: StageTimings,
}

pub struct SynthesisPipeline {
    models: Arc<ModelPool>,
    voices: Arc<VoiceProfileCache>,
    encoder: AudioEncoder,
    config: PipelineConfig,
}

impl SynthesisPipeline {
    pub fn new(
        models: Arc<ModelPool>,
        voices: Arc<VoiceProfileCache>,
        encoder: AudioEncoder,
        config: PipelineConfig,
    ) -> Self {
        Self {
            models,
            voices,
            encoder,
            config,
        }
    }

    pub fn models(&self) -> &Arc<ModelPool> {
        &self.models
    }

    pub fn voices(&self) -> &Arc<VoiceProfileCache> {
        &self.voices
    }

    pub async fn run(&self, input: &PipelineInput) -> Result<SynthesisOutput> {
        let mut tracker = StageTracker::new(&input.job_id);
        match self.drive(input, &mut tracker).await {
            Ok((audio, profile, converted, model)) => {
                let timings = tracker.finish();
                info!(
                    target: "pipeline",
                    job_id = %input.job_id,
                    language = %input.language,
                    format = audio.format.extension(),
                    duration_s = audio.duration_secs,
                    converted,
                    elapsed_ms = timings.total_ms(),
                    "Synthesis done"
                );
                Ok(SynthesisOutput {
                    audio,
                    language: input.language,
                    voice_profile_id: profile.map(|p| p.id.clone()),
                    converted,
                    model,
                    timings,
                })
            }
            Err(e) => {
                tracker.fail(&e);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        input: &PipelineInput,
        tracker: &mut StageTracker<'_>,
    ) -> Result<(EncodedAudio, Option<Arc<VoiceProfile>>, bool, String)> {
        let text = text::normalize(&input.text, input.language);
        if !text::is_speakable(&text) {
            return Err(SynthesisError::Validation(
                "text has nothing speakable after normalization".into(),
            ));
        }
        debug!(target: "pipeline", job_id = %input.job_id, text = %preview(&text, 80), "Normalized text");

        let profile = match &input.voice {
            Some(reference) => {
                let profile = self.resolve_voice(reference, input.mode).await?;
                tracker.advance(Stage::VoiceResolved)?;
                Some(profile)
            }
            None => None,
        };

        let lane = self.models.exclusive().await?;
        let speech = self.models.speech().await?;
        let mut audio = speech
            .generate(&text, input.language, profile.as_deref())
            .await?;
        tracker.advance(Stage::Generated)?;

        let mut model = speech.name().to_string();
        let mut converted = false;
        if let Some(tone_color) = profile.as_ref().and_then(|p| p.tone_color.as_ref()) {
            let conversion = async {
                let cloning = self.models.voice_cloning().await?;
                let out = cloning.convert_timbre(&audio, tone_color).await?;
                Ok::<_, SynthesisError>((out, cloning.name()))
            }
            .await;
            match conversion {
                Ok((out, cloning_name)) => {
                    audio = out;
                    converted = true;
                    model = format!("{}+{}", model, cloning_name);
                    tracker.advance(Stage::Converted)?;
                }
                Err(e) if self.config.strict_conversion => return Err(e),
                Err(e) => {
                    warn!(
                        target: "pipeline",
                        job_id = %input.job_id,
                        error = %e,
                        "Tone-color conversion failed; returning unconverted audio"
                    );
                }
            }
        }
        drop(lane);

        if let Some(target) = self.config.target_rms {
            audio.normalize_rms(target);
        }
        let encoded = self.encoder.encode(&audio, input.format).await?;
        tracker.advance(Stage::Encoded)?;
        tracker.advance(Stage::Done)?;
        Ok((encoded, profile, converted, model))
    }

    /// Enhanced derivation that fails on the cloning model falls back to the
    /// base profile unless conversion is strict.
    async fn resolve_voice(
        &self,
        reference: &VoiceReference,
        mode: CloneMode,
    ) -> Result<Arc<VoiceProfile>> {
        match self.voices.resolve(reference, mode).await {
            Err(e)
                if mode == CloneMode::Enhanced
                    && !self.config.strict_conversion
                    && matches!(
                        e,
                        SynthesisError::ModelLoad { .. } | SynthesisError::Inference { .. }
                    ) =>
            {
                warn!(
                    target: "pipeline",
                    url = %reference.url,
                    error = %e,
                    "Enhanced voice derivation failed; using base cloning"
                );
                self.voices.resolve(reference, CloneMode::Base).await
            }
            other => other,
        }
    }
}
