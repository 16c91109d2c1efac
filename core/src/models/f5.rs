//! F5-TTS speech model driven through its `f5-tts_infer-cli` entry point
//!
//! Voice conditioning is the reference clip itself plus its transcript, so
//! `embed_reference` only packages the normalized WAV; the expensive work
//! happens inside `generate`.
//!
//! Language-default voices are looked up as `<DEFAULT_VOICES_DIR>/<lang>.wav`
//! with the transcript in `<lang>.txt`. Without one, the CLI's bundled
//! reference voice is used.
//!
//! Env overrides:
//! - F5_TTS_BIN, F5_TTS_MODEL, F5_TTS_CKPT_FILE, F5_TTS_VOCAB_FILE
//! - F5_TTS_NFE_STEP, F5_TTS_SPEED, F5_TTS_CROSS_FADE
//! - MODEL_CACHE_DIR, DEFAULT_VOICES_DIR, SCRATCH_DIR, DEVICE

use super::process::{probe, run_inference};
use super::{SpeechModel, VoiceEmbedding};
use crate::audio::{wav, AudioBuffer};
use crate::error::{Result, SynthesisError};
use crate::fetch::ReferenceSample;
use crate::language::Language;
use crate::utils::{env_parse, env_string, get_from_env_or_path, preview};
use crate::voice::VoiceProfile;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub const EMBEDDING_FORMAT: &str = "f5/reference-wav";

#[derive(Clone, Debug)]
pub struct F5Config {
    pub program: Option<PathBuf>,
    pub model: String,
    pub ckpt_file: Option<PathBuf>,
    pub vocab_file: Option<PathBuf>,
    pub nfe_step: u32,
    pub speed: f32,
    pub cross_fade_duration: f32,
    pub device: String,
    pub model_cache_dir: PathBuf,
    pub default_voices_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub probe_timeout_ms: u64,
}

impl Default for F5Config {
    fn default() -> Self {
        Self {
            program: get_from_env_or_path("F5_TTS_BIN", "f5-tts_infer-cli"),
            model: env_string("F5_TTS_MODEL").unwrap_or_else(|| "F5TTS_v1_Base".to_string()),
            ckpt_file: env_string("F5_TTS_CKPT_FILE").map(PathBuf::from),
            vocab_file: env_string("F5_TTS_VOCAB_FILE").map(PathBuf::from),
            nfe_step: env_parse("F5_TTS_NFE_STEP").unwrap_or(32),
            speed: env_parse("F5_TTS_SPEED").unwrap_or(1.0),
            cross_fade_duration: env_parse("F5_TTS_CROSS_FADE").unwrap_or(0.15),
            device: env_string("DEVICE").unwrap_or_else(|| "auto".to_string()),
            model_cache_dir: env_string("MODEL_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/workspace/.cache")),
            default_voices_dir: env_string("DEFAULT_VOICES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/workspace/voices/defaults")),
            scratch_dir: env_string("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            probe_timeout_ms: env_parse("MODEL_PROBE_TIMEOUT_MS").unwrap_or(120_000),
        }
    }
}

pub struct F5Model {
    cfg: F5Config,
    program: PathBuf,
}

impl F5Model {
    /// Resolve the CLI, prepare the weight cache and make sure the entry point runs.
    /// Weights missing from the cache are downloaded by the CLI on first generation.
    pub async fn load(cfg: F5Config) -> Result<Self> {
        let load_err = |message: String| SynthesisError::ModelLoad {
            model: "f5-tts".to_string(),
            message,
        };

        let program = cfg
            .program
            .clone()
            .ok_or_else(|| load_err("f5-tts_infer-cli not found; set F5_TTS_BIN".into()))?;

        tokio::fs::create_dir_all(&cfg.model_cache_dir)
            .await
            .map_err(|e| load_err(format!("model cache dir {:?}: {}", cfg.model_cache_dir, e)))?;
        tokio::fs::create_dir_all(&cfg.scratch_dir)
            .await
            .map_err(|e| load_err(format!("scratch dir {:?}: {}", cfg.scratch_dir, e)))?;

        for file in [&cfg.ckpt_file, &cfg.vocab_file].into_iter().flatten() {
            if !file.exists() {
                return Err(load_err(format!("missing weights file {:?}", file)));
            }
        }

        let mut check = Command::new(&program);
        check.arg("--help");
        probe(check, "f5-tts", Duration::from_millis(cfg.probe_timeout_ms)).await?;

        info!(target: "model", bin = ?program, model = %cfg.model, device = %cfg.device, "F5-TTS ready");
        Ok(Self { cfg, program })
    }

    fn base_command(&self, out_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--model").arg(&self.cfg.model);
        if let Some(ckpt) = &self.cfg.ckpt_file {
            cmd.arg("--ckpt_file").arg(ckpt);
        }
        if let Some(vocab) = &self.cfg.vocab_file {
            cmd.arg("--vocab_file").arg(vocab);
        }
        if self.cfg.device != "auto" {
            cmd.arg("--device").arg(&self.cfg.device);
        }
        cmd.arg("--nfe_step").arg(self.cfg.nfe_step.to_string());
        cmd.arg("--speed").arg(format!("{:.2}", self.cfg.speed));
        cmd.arg("--cross_fade_duration")
            .arg(format!("{:.2}", self.cfg.cross_fade_duration));
        cmd.arg("--output_dir").arg(out_dir);
        cmd.arg("--output_file").arg("out.wav");
        cmd.env("HF_HOME", &self.cfg.model_cache_dir);
        cmd
    }

    async fn default_voice(&self, language: Language) -> Option<(PathBuf, String)> {
        let wav_path = self
            .cfg
            .default_voices_dir
            .join(format!("{}.wav", language.code()));
        let txt_path = wav_path.with_extension("txt");
        if !wav_path.exists() {
            return None;
        }
        let transcript = tokio::fs::read_to_string(&txt_path).await.ok()?;
        Some((wav_path, transcript.trim().to_string()))
    }
}

#[async_trait]
impl SpeechModel for F5Model {
    fn name(&self) -> &'static str {
        "f5-tts"
    }

    async fn embed_reference(
        &self,
        sample: &ReferenceSample,
        _transcript: &str,
    ) -> Result<VoiceEmbedding> {
        Ok(VoiceEmbedding::new(EMBEDDING_FORMAT, sample.wav_bytes.clone()))
    }

    async fn generate(
        &self,
        text: &str,
        language: Language,
        voice: Option<&VoiceProfile>,
    ) -> Result<AudioBuffer> {
        let scratch = tempfile::Builder::new()
            .prefix("tts_")
            .tempdir_in(&self.cfg.scratch_dir)?;
        let mut cmd = self.base_command(scratch.path());

        match voice {
            Some(profile) => {
                if profile.conditioning.format != EMBEDDING_FORMAT {
                    return Err(SynthesisError::inference(
                        format!(
                            "voice profile {} carries '{}' conditioning, expected '{}'",
                            profile.id, profile.conditioning.format, EMBEDDING_FORMAT
                        ),
                        false,
                    ));
                }
                let ref_path = scratch.path().join("reference.wav");
                tokio::fs::write(&ref_path, profile.conditioning.data.as_slice()).await?;
                cmd.arg("--ref_audio").arg(&ref_path);
                cmd.arg("--ref_text").arg(&profile.transcript);
            }
            None => {
                if let Some((ref_path, ref_text)) = self.default_voice(language).await {
                    debug!(target: "model", language = %language, voice = ?ref_path, "Using language-default voice");
                    cmd.arg("--ref_audio").arg(ref_path);
                    cmd.arg("--ref_text").arg(ref_text);
                }
            }
        }
        cmd.arg("--gen_text").arg(text);

        debug!(target: "model", text = %preview(text, 50), language = %language, cloned = voice.is_some(), "F5-TTS generating");
        run_inference(cmd, "f5-tts").await?;

        let out_path = scratch.path().join("out.wav");
        let bytes = tokio::fs::read(&out_path).await.map_err(|e| {
            SynthesisError::inference(format!("f5-tts produced no output: {}", e), false)
        })?;
        let audio = wav::decode(&bytes).map_err(|e| {
            SynthesisError::inference(format!("f5-tts output unreadable: {}", e), false)
        })?;
        if audio.is_empty() {
            return Err(SynthesisError::inference("f5-tts produced empty audio", false));
        }
        Ok(audio)
    }
}
