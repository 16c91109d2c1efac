use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::OutputFormat;
use crate::fetch::{FetchConfig, SampleBounds};
use crate::handler::{HandlerConfig, OutputMode};
use crate::language::{parse_language_list, Language};
use crate::models::f5::F5Config;
use crate::models::openvoice::OpenVoiceConfig;
use crate::models::ModelPoolConfig;
use crate::pipeline::PipelineConfig;
use crate::request::RequestPolicy;
use crate::runtime::RuntimeConfig;
use crate::storage::StorageConfig;
use crate::utils::{env_flag, env_parse, env_string, get_from_env_or_path};
use crate::voice::VoiceCacheConfig;

/// Complete worker configuration
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub execution_timeout_ms: u64,
    pub supported_languages: Vec<Language>,
    /// Used for unknown or disabled languages; without it they are rejected
    pub fallback_language: Option<Language>,
    pub max_text_chars: usize,
    pub output_mode: OutputMode,
    pub output_format: OutputFormat,
    pub strict_conversion: bool,
    pub target_rms: Option<f32>,
    /// Where the voice registry keeps `profiles.json`
    pub voices_dir: PathBuf,
    pub ffmpeg_bin: Option<PathBuf>,
    pub voice_cache: VoiceCacheConfig,
    pub sample: SampleBounds,
    pub fetch: FetchConfig,
    pub models: ModelPoolConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub speech: F5Config,
    pub cloning: OpenVoiceConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let supported_languages = env_string("SUPPORTED_LANGUAGES")
            .map(|s| parse_language_list(&s))
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| Language::ALL.to_vec());
        Self {
            execution_timeout_ms: env_parse("EXECUTION_TIMEOUT_MS").unwrap_or(300_000),
            supported_languages,
            fallback_language: env_parse("FALLBACK_LANGUAGE"),
            max_text_chars: env_parse("MAX_TEXT_CHARS").unwrap_or(5_000),
            output_mode: env_parse("OUTPUT_MODE").unwrap_or_default(),
            output_format: env_parse("OUTPUT_FORMAT").unwrap_or_default(),
            strict_conversion: env_flag("STRICT_CONVERSION").unwrap_or(false),
            target_rms: match env_parse::<f32>("TARGET_RMS") {
                Some(v) if v <= 0.0 => None,
                Some(v) => Some(v),
                None => Some(0.1),
            },
            voices_dir: env_string("VOICES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/workspace/voices")),
            ffmpeg_bin: get_from_env_or_path("FFMPEG_BIN", "ffmpeg"),
            voice_cache: VoiceCacheConfig::default(),
            sample: SampleBounds::default(),
            fetch: FetchConfig::default(),
            models: ModelPoolConfig::default(),
            storage: StorageConfig::default(),
            runtime: RuntimeConfig::default(),
            speech: F5Config::default(),
            cloning: OpenVoiceConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a TOML file (path via VOXCAST_CONFIG or ./voxcast.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let path = std::env::var("VOXCAST_CONFIG").unwrap_or_else(|_| "voxcast.toml".into());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Self {
        let default = Self::default();
        if !path.exists() {
            tracing::info!(target: "config", path = %path.display(), "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<WorkerToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "config", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    pub fn request_policy(&self) -> RequestPolicy {
        RequestPolicy {
            supported_languages: self.supported_languages.clone(),
            fallback_language: self.fallback_language,
            max_text_chars: self.max_text_chars,
            default_format: self.output_format,
        }
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            execution_timeout_ms: self.execution_timeout_ms,
            output_mode: self.output_mode,
            policy: self.request_policy(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            strict_conversion: self.strict_conversion,
            target_rms: self.target_rms,
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct WorkerToml {
    pub execution_timeout_ms: Option<u64>,
    pub supported_languages: Option<Vec<String>>,
    pub fallback_language: Option<String>,
    pub max_text_chars: Option<usize>,
    pub output_mode: Option<String>,
    pub output_format: Option<String>,
    pub strict_conversion: Option<bool>,
    pub target_rms: Option<f32>,
    pub voices_dir: Option<PathBuf>,
    pub ffmpeg_bin: Option<PathBuf>,
    pub cache: Option<CacheToml>,
    pub sample: Option<SampleToml>,
    pub fetch: Option<FetchToml>,
    pub models: Option<ModelsToml>,
    pub storage: Option<StorageToml>,
    pub runtime: Option<RuntimeToml>,
    pub speech: Option<SpeechToml>,
    pub cloning: Option<CloningToml>,
}

impl WorkerToml {
    fn overlay(self, mut base: WorkerConfig) -> WorkerConfig {
        if let Some(v) = self.execution_timeout_ms {
            base.execution_timeout_ms = v;
        }
        if let Some(list) = self.supported_languages {
            let langs: Vec<Language> = list.iter().filter_map(|s| s.parse().ok()).collect();
            if langs.is_empty() {
                tracing::warn!(target: "config", "supported_languages has no known codes; keeping defaults");
            } else {
                base.supported_languages = langs;
            }
        }
        if let Some(v) = self.fallback_language {
            match v.parse::<Language>() {
                Ok(lang) => base.fallback_language = Some(lang),
                Err(bad) => {
                    tracing::warn!(target: "config", value = %bad, "Unknown fallback_language ignored")
                }
            }
        }
        if let Some(v) = self.max_text_chars {
            base.max_text_chars = v;
        }
        if let Some(v) = self.output_mode {
            match v.parse() {
                Ok(mode) => base.output_mode = mode,
                Err(bad) => tracing::warn!(target: "config", value = %bad, "Unknown output_mode ignored"),
            }
        }
        if let Some(v) = self.output_format {
            match v.parse() {
                Ok(format) => base.output_format = format,
                Err(bad) => tracing::warn!(target: "config", value = %bad, "Unknown output_format ignored"),
            }
        }
        if let Some(v) = self.strict_conversion {
            base.strict_conversion = v;
        }
        if let Some(v) = self.target_rms {
            base.target_rms = (v > 0.0).then_some(v);
        }
        if let Some(v) = self.voices_dir {
            base.voices_dir = v;
        }
        if let Some(v) = self.ffmpeg_bin {
            base.ffmpeg_bin = Some(v);
        }
        if let Some(c) = self.cache {
            c.apply(&mut base.voice_cache);
        }
        if let Some(s) = self.sample {
            s.apply(&mut base.sample, &mut base.fetch);
        }
        if let Some(f) = self.fetch {
            f.apply(&mut base.fetch);
        }
        if let Some(m) = self.models {
            m.apply(&mut base.models);
        }
        if let Some(s) = self.storage {
            s.apply(&mut base.storage);
        }
        if let Some(r) = self.runtime {
            r.apply(&mut base.runtime);
        }
        if let Some(s) = self.speech {
            s.apply(&mut base.speech);
        }
        if let Some(c) = self.cloning {
            c.apply(&mut base.cloning);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct CacheToml {
    pub capacity: Option<usize>,
    pub ttl_secs: Option<u64>,
}

impl CacheToml {
    fn apply(self, c: &mut VoiceCacheConfig) {
        if let Some(v) = self.capacity {
            c.capacity = v;
        }
        if let Some(v) = self.ttl_secs {
            c.ttl_secs = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SampleToml {
    pub min_seconds: Option<f64>,
    pub max_seconds: Option<f64>,
    pub max_bytes: Option<usize>,
}

impl SampleToml {
    fn apply(self, s: &mut SampleBounds, f: &mut FetchConfig) {
        if let Some(v) = self.min_seconds {
            s.min_seconds = v;
        }
        if let Some(v) = self.max_seconds {
            s.max_seconds = v;
        }
        if let Some(v) = self.max_bytes {
            f.max_bytes = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct FetchToml {
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

impl FetchToml {
    fn apply(self, f: &mut FetchConfig) {
        if let Some(v) = self.timeout_ms {
            f.timeout_ms = v;
        }
        if let Some(v) = self.retries {
            f.retries = v;
        }
        if let Some(v) = self.retry_backoff_ms {
            f.retry_backoff_ms = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ModelsToml {
    pub retry_after_secs: Option<u64>,
    pub preload: Option<bool>,
}

impl ModelsToml {
    fn apply(self, m: &mut ModelPoolConfig) {
        if let Some(v) = self.retry_after_secs {
            m.retry_after_secs = v;
        }
        if let Some(v) = self.preload {
            m.preload = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct StorageToml {
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub token: Option<String>,
    pub prefix: Option<String>,
    pub public_base_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl StorageToml {
    fn apply(self, s: &mut StorageConfig) {
        if self.endpoint.is_some() {
            s.endpoint = self.endpoint;
        }
        if let Some(v) = self.bucket {
            s.bucket = v;
        }
        if let Some(v) = self.region {
            s.region = v;
        }
        if self.access_key.is_some() {
            s.access_key = self.access_key;
        }
        if self.secret_key.is_some() {
            s.secret_key = self.secret_key;
        }
        if self.token.is_some() {
            s.token = self.token;
        }
        if let Some(v) = self.prefix {
            s.prefix = v;
        }
        if self.public_base_url.is_some() {
            s.public_base_url = self.public_base_url;
        }
        if let Some(v) = self.timeout_ms {
            s.timeout_ms = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RuntimeToml {
    pub worker_id: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub test_input: Option<PathBuf>,
    pub metrics_interval_secs: Option<u64>,
}

impl RuntimeToml {
    fn apply(self, r: &mut RuntimeConfig) {
        if let Some(v) = self.worker_id {
            r.worker_id = v;
        }
        if let Some(v) = self.poll_interval_ms {
            r.poll_interval_ms = v;
        }
        if let Some(v) = self.request_timeout_ms {
            r.request_timeout_ms = v;
        }
        if let Some(v) = self.test_input {
            r.test_input = v;
        }
        if let Some(v) = self.metrics_interval_secs {
            r.metrics_interval_secs = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SpeechToml {
    pub program: Option<PathBuf>,
    pub model: Option<String>,
    pub ckpt_file: Option<PathBuf>,
    pub vocab_file: Option<PathBuf>,
    pub nfe_step: Option<u32>,
    pub speed: Option<f32>,
    pub cross_fade_duration: Option<f32>,
    pub device: Option<String>,
    pub model_cache_dir: Option<PathBuf>,
    pub default_voices_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
}

impl SpeechToml {
    fn apply(self, s: &mut F5Config) {
        if self.program.is_some() {
            s.program = self.program;
        }
        if let Some(v) = self.model {
            s.model = v;
        }
        if self.ckpt_file.is_some() {
            s.ckpt_file = self.ckpt_file;
        }
        if self.vocab_file.is_some() {
            s.vocab_file = self.vocab_file;
        }
        if let Some(v) = self.nfe_step {
            s.nfe_step = v;
        }
        if let Some(v) = self.speed {
            s.speed = v;
        }
        if let Some(v) = self.cross_fade_duration {
            s.cross_fade_duration = v;
        }
        if let Some(v) = self.device {
            s.device = v;
        }
        if let Some(v) = self.model_cache_dir {
            s.model_cache_dir = v;
        }
        if let Some(v) = self.default_voices_dir {
            s.default_voices_dir = v;
        }
        if let Some(v) = self.scratch_dir {
            s.scratch_dir = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct CloningToml {
    pub python: Option<PathBuf>,
    pub openvoice_dir: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub device: Option<String>,
    pub use_vad: Option<bool>,
    pub scratch_dir: Option<PathBuf>,
}

impl CloningToml {
    fn apply(self, c: &mut OpenVoiceConfig) {
        if self.python.is_some() {
            c.python = self.python;
        }
        if let Some(v) = self.openvoice_dir {
            c.openvoice_dir = v;
        }
        if self.script.is_some() {
            c.script = self.script;
        }
        if let Some(v) = self.device {
            c.device = v;
        }
        if let Some(v) = self.use_vad {
            c.use_vad = v;
        }
        if let Some(v) = self.scratch_dir {
            c.scratch_dir = v;
        }
    }
}
