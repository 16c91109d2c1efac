//! Model collaborators and the process-wide model pool
//!
//! The generative models are opaque. The core only needs:
//! - `SpeechModel`: reference embedding + text-to-speech generation
//! - `VoiceCloningModel`: tone-color embedding + timbre conversion
//!
//! `ModelLoader` builds ready handles; `ModelPool` owns them for the life of
//! the worker. The shipped loaders drive the models' command-line entry
//! points (`f5`, `openvoice`).

use crate::audio::AudioBuffer;
use crate::error::Result;
use crate::fetch::ReferenceSample;
use crate::language::Language;
use crate::voice::VoiceProfile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod f5;
pub mod openvoice;
mod pool;
mod process;

pub use pool::{ModelPool, ModelPoolConfig, ModelStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Speech,
    VoiceCloning,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Speech => "speech",
            ModelKind::VoiceCloning => "voice_cloning",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque artifact produced by a model from a reference sample.
///
/// `format` names the producer's encoding (e.g. `"f5/reference-wav"`); the
/// bytes are only ever interpreted by the model that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceEmbedding {
    pub format: String,
    pub data: Arc<Vec<u8>>,
}

impl VoiceEmbedding {
    pub fn new(format: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            format: format.into(),
            data: Arc::new(data),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

#[async_trait]
pub trait SpeechModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Derive the conditioning artifact used to speak in a reference voice.
    async fn embed_reference(
        &self,
        sample: &ReferenceSample,
        transcript: &str,
    ) -> Result<VoiceEmbedding>;

    /// Generate speech for already-normalized text. `voice == None` selects
    /// the language-default voice.
    async fn generate(
        &self,
        text: &str,
        language: Language,
        voice: Option<&VoiceProfile>,
    ) -> Result<AudioBuffer>;
}

#[async_trait]
pub trait VoiceCloningModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extract the tone-color embedding of a reference speaker.
    async fn derive_profile(
        &self,
        sample: &ReferenceSample,
        transcript: &str,
    ) -> Result<VoiceEmbedding>;

    /// Re-render `audio` with the timbre carried by `target`.
    async fn convert_timbre(&self, audio: &AudioBuffer, target: &VoiceEmbedding) -> Result<AudioBuffer>;
}

/// Builds ready model handles. Called at most once per successful load.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load_speech(&self) -> Result<Arc<dyn SpeechModel>>;
    async fn load_voice_cloning(&self) -> Result<Arc<dyn VoiceCloningModel>>;
}

/// Ready handle handed out by the pool.
#[derive(Clone)]
pub enum ModelHandle {
    Speech(Arc<dyn SpeechModel>),
    VoiceCloning(Arc<dyn VoiceCloningModel>),
}

impl ModelHandle {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelHandle::Speech(_) => ModelKind::Speech,
            ModelHandle::VoiceCloning(_) => ModelKind::VoiceCloning,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelHandle::Speech(m) => m.name(),
            ModelHandle::VoiceCloning(m) => m.name(),
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// Loader backed by the F5-TTS and OpenVoice command-line entry points.
pub struct CliModelLoader {
    pub speech: f5::F5Config,
    pub cloning: openvoice::OpenVoiceConfig,
}

#[async_trait]
impl ModelLoader for CliModelLoader {
    async fn load_speech(&self) -> Result<Arc<dyn SpeechModel>> {
        let model = f5::F5Model::load(self.speech.clone()).await?;
        Ok(Arc::new(model))
    }

    async fn load_voice_cloning(&self) -> Result<Arc<dyn VoiceCloningModel>> {
        let model = openvoice::OpenVoiceModel::load(self.cloning.clone()).await?;
        Ok(Arc::new(model))
    }
}
