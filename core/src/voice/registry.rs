//! Named, per-user voices persisted as `profiles.json` under the voices dir.
//!
//! A stored voice only records where its sample lives and what it says; the
//! derived embeddings stay in the in-memory profile cache.

use crate::error::{Result, SynthesisError};
use crate::language::Language;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::VoiceReference;

pub const REGISTRY_FILE: &str = "profiles.json";

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVoice {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub voice_sample_url: String,
    pub transcript: String,
    pub language: Language,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredVoice {
    pub fn reference(&self) -> VoiceReference {
        VoiceReference::new(&self.voice_sample_url, &self.transcript)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewVoice {
    pub user_id: String,
    pub name: String,
    pub voice_sample_url: String,
    pub transcript: String,
    #[serde(default = "default_language")]
    pub language: Language,
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_language() -> Language {
    Language::En
}

/// Partial update; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceUpdate {
    pub name: Option<String>,
    pub voice_sample_url: Option<String>,
    pub transcript: Option<String>,
    pub language: Option<Language>,
    pub metadata: Option<Metadata>,
}

pub(crate) fn validate_sample_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url.trim())
        .map_err(|e| SynthesisError::Validation(format!("invalid voice sample URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        scheme => Err(SynthesisError::Validation(format!(
            "voice sample URL must be absolute http(s), got '{}'",
            scheme
        ))),
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SynthesisError::Validation(format!("'{}' must not be empty", field)));
    }
    Ok(())
}

pub struct VoiceRegistry {
    path: PathBuf,
    voices: RwLock<BTreeMap<String, StoredVoice>>,
}

impl VoiceRegistry {
    /// Open the registry in `dir`, creating the directory if needed. A
    /// missing file is an empty registry; an unreadable one is an error.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(REGISTRY_FILE);

        let voices = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!(target: "registry", path = ?path, voices = voices.len(), "Voice registry opened");
        Ok(Self {
            path,
            voices: RwLock::new(voices),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, voices: &BTreeMap<String, StoredVoice>) -> Result<()> {
        let json = serde_json::to_vec_pretty(voices)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn create(&self, new: NewVoice) -> Result<StoredVoice> {
        require("user_id", &new.user_id)?;
        require("name", &new.name)?;
        require("voice_clone_text", &new.transcript)?;
        validate_sample_url(&new.voice_sample_url)?;

        let now = Utc::now();
        let voice = StoredVoice {
            id: format!("voice_{}", uuid::Uuid::new_v4().simple()),
            user_id: new.user_id.trim().to_string(),
            name: new.name.trim().to_string(),
            voice_sample_url: new.voice_sample_url.trim().to_string(),
            transcript: new.transcript.trim().to_string(),
            language: new.language,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };

        let mut voices = self.voices.write().await;
        voices.insert(voice.id.clone(), voice.clone());
        if let Err(e) = self.persist(&voices).await {
            voices.remove(&voice.id);
            return Err(e);
        }
        info!(target: "registry", id = %voice.id, user = %voice.user_id, "Voice created");
        Ok(voice)
    }

    pub async fn get(&self, id: &str) -> Option<StoredVoice> {
        self.voices.read().await.get(id).cloned()
    }

    /// Voices of one user, oldest first.
    pub async fn list_for_user(&self, user_id: &str) -> Vec<StoredVoice> {
        let mut list: Vec<StoredVoice> = self
            .voices
            .read()
            .await
            .values()
            .filter(|v| v.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn update(&self, id: &str, update: VoiceUpdate) -> Result<Option<StoredVoice>> {
        if let Some(name) = &update.name {
            require("name", name)?;
        }
        if let Some(text) = &update.transcript {
            require("voice_clone_text", text)?;
        }
        if let Some(url) = &update.voice_sample_url {
            validate_sample_url(url)?;
        }

        let mut voices = self.voices.write().await;
        let Some(previous) = voices.get(id).cloned() else {
            return Ok(None);
        };
        let mut voice = previous.clone();
        if let Some(name) = update.name {
            voice.name = name.trim().to_string();
        }
        if let Some(url) = update.voice_sample_url {
            voice.voice_sample_url = url.trim().to_string();
        }
        if let Some(text) = update.transcript {
            voice.transcript = text.trim().to_string();
        }
        if let Some(language) = update.language {
            voice.language = language;
        }
        if let Some(metadata) = update.metadata {
            voice.metadata.extend(metadata);
        }
        voice.updated_at = Utc::now();

        voices.insert(id.to_string(), voice.clone());
        if let Err(e) = self.persist(&voices).await {
            voices.insert(id.to_string(), previous);
            return Err(e);
        }
        info!(target: "registry", id = %id, "Voice updated");
        Ok(Some(voice))
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut voices = self.voices.write().await;
        let Some(removed) = voices.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&voices).await {
            warn!(target: "registry", id = %id, error = %e, "Could not persist voice deletion");
            voices.insert(id.to_string(), removed);
            return Err(e);
        }
        info!(target: "registry", id = %id, "Voice deleted");
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.voices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
