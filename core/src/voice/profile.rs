use crate::models::VoiceEmbedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which cloning path a profile was derived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneMode {
    /// Speech model conditioning only
    Base,
    /// Speech model conditioning plus tone-color conversion
    Enhanced,
}

impl CloneMode {
    pub fn from_flag(use_openvoice: bool) -> Self {
        if use_openvoice {
            CloneMode::Enhanced
        } else {
            CloneMode::Base
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloneMode::Base => "base",
            CloneMode::Enhanced => "enhanced",
        }
    }
}

/// Where a cloned voice comes from, as given on a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceReference {
    pub url: String,
    pub transcript: String,
}

impl VoiceReference {
    pub fn new(url: impl Into<String>, transcript: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transcript: transcript.into(),
        }
    }
}

fn digest_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Content identity of a profile: sample bytes, transcript, mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(content_hash: &str, transcript: &str, mode: CloneMode) -> Self {
        Fingerprint(digest_parts(&[content_hash, transcript.trim(), mode.as_str()]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..16.min(self.0.len())]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short())
    }
}

/// Request-side identity: URL, transcript, mode. Aliases a `Fingerprint`
/// once the sample behind the URL has been fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RequestKey(String);

impl RequestKey {
    pub(crate) fn new(reference: &VoiceReference, mode: CloneMode) -> Self {
        RequestKey(digest_parts(&[
            reference.url.trim(),
            reference.transcript.trim(),
            mode.as_str(),
        ]))
    }
}

#[derive(Debug, Clone)]
pub struct VoiceProfile {
    pub id: String,
    pub fingerprint: Fingerprint,
    pub mode: CloneMode,
    pub transcript: String,
    /// Speech model conditioning
    pub conditioning: VoiceEmbedding,
    /// Tone-color embedding, enhanced mode only
    pub tone_color: Option<VoiceEmbedding>,
    pub sample_duration_secs: f64,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
}

impl VoiceProfile {
    pub fn id_for(fingerprint: &Fingerprint) -> String {
        format!("vp_{}", fingerprint.short())
    }
}
