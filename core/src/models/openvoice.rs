//! OpenVoice tone-color converter driven through a helper entry point
//!
//! The converter is reached as `<python> <script> <subcommand> ...`:
//! - `check --checkpoint-dir D --device X`
//! - `extract --checkpoint-dir D --device X [--vad] --reference in.wav --output se.pth`
//! - `convert --checkpoint-dir D --device X [--vad] --source in.wav --target-se se.pth --output out.wav`
//!
//! The helper ships with this crate (`scripts/voxcast_openvoice.py`) and is
//! written into the scratch dir on load unless `OPENVOICE_SCRIPT` points
//! elsewhere. It runs with `OPENVOICE_DIR` on `PYTHONPATH`, and weights are
//! expected under `<OPENVOICE_DIR>/checkpoints/converter` (`config.json` and
//! `checkpoint.pth`).
//!
//! Env overrides:
//! - OPENVOICE_DIR, OPENVOICE_PYTHON, OPENVOICE_SCRIPT, OPENVOICE_VAD
//! - SCRATCH_DIR, DEVICE

use super::process::{probe, run_inference};
use super::{VoiceCloningModel, VoiceEmbedding};
use crate::audio::{wav, AudioBuffer};
use crate::error::{Result, SynthesisError};
use crate::fetch::ReferenceSample;
use crate::utils::{env_flag, env_parse, env_string, get_from_env_or_path};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub const EMBEDDING_FORMAT: &str = "openvoice/tone-color-se";

const HELPER_NAME: &str = "voxcast_openvoice.py";
const HELPER_SOURCE: &str = include_str!("../../scripts/voxcast_openvoice.py");

#[derive(Clone, Debug)]
pub struct OpenVoiceConfig {
    pub python: Option<PathBuf>,
    pub openvoice_dir: PathBuf,
    /// Helper entry point; `None` uses the bundled one
    pub script: Option<PathBuf>,
    pub device: String,
    pub use_vad: bool,
    pub scratch_dir: PathBuf,
    pub probe_timeout_ms: u64,
}

impl Default for OpenVoiceConfig {
    fn default() -> Self {
        let openvoice_dir = env_string("OPENVOICE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/workspace/OpenVoice"));
        Self {
            python: get_from_env_or_path("OPENVOICE_PYTHON", "python3"),
            openvoice_dir,
            script: env_string("OPENVOICE_SCRIPT").map(PathBuf::from),
            device: env_string("DEVICE").unwrap_or_else(|| "auto".to_string()),
            use_vad: env_flag("OPENVOICE_VAD").unwrap_or(true),
            scratch_dir: env_string("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            probe_timeout_ms: env_parse("MODEL_PROBE_TIMEOUT_MS").unwrap_or(120_000),
        }
    }
}

impl OpenVoiceConfig {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.openvoice_dir.join("checkpoints").join("converter")
    }
}

pub struct OpenVoiceModel {
    cfg: OpenVoiceConfig,
    python: PathBuf,
    script: PathBuf,
}

impl OpenVoiceModel {
    pub async fn load(cfg: OpenVoiceConfig) -> Result<Self> {
        let load_err = |message: String| SynthesisError::ModelLoad {
            model: "openvoice".to_string(),
            message,
        };

        let python = cfg
            .python
            .clone()
            .ok_or_else(|| load_err("python interpreter not found; set OPENVOICE_PYTHON".into()))?;

        let ckpt = cfg.checkpoint_dir();
        for file in ["config.json", "checkpoint.pth"] {
            let p = ckpt.join(file);
            if !p.exists() {
                return Err(load_err(format!("missing converter weights {:?}", p)));
            }
        }
        tokio::fs::create_dir_all(&cfg.scratch_dir)
            .await
            .map_err(|e| load_err(format!("scratch dir {:?}: {}", cfg.scratch_dir, e)))?;
        let script = match &cfg.script {
            Some(path) if path.exists() => path.clone(),
            Some(path) => {
                return Err(load_err(format!("converter entry point {:?} not found", path)))
            }
            None => {
                let path = cfg.scratch_dir.join(HELPER_NAME);
                tokio::fs::write(&path, HELPER_SOURCE)
                    .await
                    .map_err(|e| load_err(format!("writing helper {:?}: {}", path, e)))?;
                path
            }
        };

        let model = Self {
            cfg,
            python,
            script,
        };
        probe(
            model.command("check"),
            "openvoice",
            Duration::from_millis(model.cfg.probe_timeout_ms),
        )
        .await?;

        info!(target: "model", checkpoint = ?ckpt, script = ?model.script, device = %model.cfg.device, "OpenVoice converter ready");
        Ok(model)
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.arg(&self.script).arg(subcommand);
        cmd.arg("--checkpoint-dir").arg(self.cfg.checkpoint_dir());
        cmd.arg("--device").arg(&self.cfg.device);
        if self.cfg.use_vad && subcommand != "check" {
            cmd.arg("--vad");
        }
        cmd.env("PYTHONPATH", python_path(&self.cfg.openvoice_dir));
        cmd.current_dir(&self.cfg.openvoice_dir);
        cmd
    }

    fn scratch(&self) -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new()
            .prefix("openvoice_")
            .tempdir_in(&self.cfg.scratch_dir)?)
    }
}

/// `dir` ahead of any inherited PYTHONPATH.
fn python_path(dir: &Path) -> OsString {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(existing) = std::env::var_os("PYTHONPATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths).unwrap_or_else(|_| dir.as_os_str().to_os_string())
}

#[async_trait]
impl VoiceCloningModel for OpenVoiceModel {
    fn name(&self) -> &'static str {
        "openvoice"
    }

    async fn derive_profile(
        &self,
        sample: &ReferenceSample,
        _transcript: &str,
    ) -> Result<VoiceEmbedding> {
        let scratch = self.scratch()?;
        let ref_path = scratch.path().join("reference.wav");
        let se_path = scratch.path().join("target_se.pth");
        tokio::fs::write(&ref_path, &sample.wav_bytes).await?;

        let mut cmd = self.command("extract");
        cmd.arg("--reference").arg(&ref_path);
        cmd.arg("--output").arg(&se_path);
        debug!(target: "model", url = %sample.source_url, "OpenVoice extracting tone color");
        run_inference(cmd, "openvoice extract").await?;

        let data = tokio::fs::read(&se_path).await.map_err(|e| {
            SynthesisError::inference(format!("openvoice produced no embedding: {}", e), false)
        })?;
        Ok(VoiceEmbedding::new(EMBEDDING_FORMAT, data))
    }

    async fn convert_timbre(&self, audio: &AudioBuffer, target: &VoiceEmbedding) -> Result<AudioBuffer> {
        if target.format != EMBEDDING_FORMAT {
            return Err(SynthesisError::inference(
                format!("cannot convert with '{}' embedding", target.format),
                false,
            ));
        }
        let scratch = self.scratch()?;
        let src_path = scratch.path().join("source.wav");
        let se_path = scratch.path().join("target_se.pth");
        let out_path = scratch.path().join("converted.wav");
        tokio::fs::write(&src_path, wav::encode_pcm16(audio)?).await?;
        tokio::fs::write(&se_path, target.data.as_slice()).await?;

        let mut cmd = self.command("convert");
        cmd.arg("--source").arg(&src_path);
        cmd.arg("--target-se").arg(&se_path);
        cmd.arg("--output").arg(&out_path);
        run_inference(cmd, "openvoice convert").await?;

        let bytes = tokio::fs::read(&out_path).await.map_err(|e| {
            SynthesisError::inference(format!("openvoice produced no audio: {}", e), false)
        })?;
        wav::decode(&bytes).map_err(|e| {
            SynthesisError::inference(format!("openvoice output unreadable: {}", e), false)
        })
    }
}
