//! Job envelope parsing and request validation
//!
//! Everything here is pure: a rejected job never reaches the network, the
//! models or the voice cache.

use crate::audio::OutputFormat;
use crate::error::{Result, SynthesisError};
use crate::language::Language;
use crate::voice::registry::{validate_sample_url, Metadata};
use crate::voice::{CloneMode, NewVoice, VoiceReference, VoiceUpdate};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Job as delivered by the serverless platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl Job {
    pub fn new(id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Some(id.into()),
            input,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Synthesize,
    CreateVoice,
    GetVoice,
    ListVoices,
    UpdateVoice,
    DeleteVoice,
}

impl std::str::FromStr for JobAction {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "synthesize" | "tts" => Ok(JobAction::Synthesize),
            "create_voice" => Ok(JobAction::CreateVoice),
            "get_voice" => Ok(JobAction::GetVoice),
            "list_voices" => Ok(JobAction::ListVoices),
            "update_voice" => Ok(JobAction::UpdateVoice),
            "delete_voice" => Ok(JobAction::DeleteVoice),
            other => Err(SynthesisError::Validation(format!("unknown action '{}'", other))),
        }
    }
}

/// Raw `input` object of a job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobInput {
    pub action: Option<String>,
    pub text: Option<String>,
    pub language: Option<String>,
    pub voice_clone_url: Option<String>,
    pub voice_clone_text: Option<String>,
    pub use_openvoice: bool,
    pub output_format: Option<String>,
    pub voice_profile_id: Option<String>,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub metadata: Option<Metadata>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    non_empty(value)
        .ok_or_else(|| SynthesisError::Validation(format!("'{}' is required", field)))
}

impl JobInput {
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(SynthesisError::Validation("job input must be a JSON object".into()));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| SynthesisError::Validation(format!("malformed job input: {}", e)))
    }

    pub fn action(&self) -> Result<JobAction> {
        self.action.as_deref().unwrap_or("").parse()
    }

    pub fn profile_id(&self) -> Result<&str> {
        required(&self.voice_profile_id, "voice_profile_id")
    }

    pub fn owner(&self) -> Result<&str> {
        required(&self.user_id, "user_id")
    }

    pub fn new_voice(&self, policy: &RequestPolicy) -> Result<NewVoice> {
        let language = match non_empty(&self.language) {
            Some(tag) => policy.resolve_language(tag)?.0,
            None => Language::En,
        };
        Ok(NewVoice {
            user_id: self.owner()?.to_string(),
            name: required(&self.name, "name")?.to_string(),
            voice_sample_url: required(&self.voice_clone_url, "voice_clone_url")?.to_string(),
            transcript: required(&self.voice_clone_text, "voice_clone_text")?.to_string(),
            language,
            metadata: self.metadata.clone().unwrap_or_default(),
        })
    }

    pub fn voice_update(&self, policy: &RequestPolicy) -> Result<VoiceUpdate> {
        let language = match non_empty(&self.language) {
            Some(tag) => Some(policy.resolve_language(tag)?.0),
            None => None,
        };
        Ok(VoiceUpdate {
            name: non_empty(&self.name).map(str::to_string),
            voice_sample_url: non_empty(&self.voice_clone_url).map(str::to_string),
            transcript: non_empty(&self.voice_clone_text).map(str::to_string),
            language,
            metadata: self.metadata.clone(),
        })
    }
}

/// Limits and defaults applied while validating synthesis requests.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    pub supported_languages: Vec<Language>,
    pub fallback_language: Option<Language>,
    pub max_text_chars: usize,
    pub default_format: OutputFormat,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            supported_languages: Language::ALL.to_vec(),
            fallback_language: None,
            max_text_chars: 5_000,
            default_format: OutputFormat::Mp3,
        }
    }
}

impl RequestPolicy {
    /// Map a requested tag to an enabled language. Returns the language and,
    /// when the fallback was applied, the tag as requested.
    pub fn resolve_language(&self, tag: &str) -> Result<(Language, Option<String>)> {
        let parsed = tag.parse::<Language>().ok();
        match parsed {
            Some(lang) if self.supported_languages.contains(&lang) => Ok((lang, None)),
            _ => match self.fallback_language {
                Some(fallback) => {
                    warn!(target: "handler", requested = %tag, fallback = %fallback, "Language not enabled; using fallback");
                    Ok((fallback, Some(tag.to_string())))
                }
                None => Err(SynthesisError::UnsupportedLanguage(format!(
                    "'{}' is not one of [{}]",
                    tag,
                    self.supported_languages
                        .iter()
                        .map(Language::code)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))),
            },
        }
    }
}

/// A validated `synthesize` job.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub job_id: String,
    pub text: String,
    pub language: Language,
    /// Set when the requested language was replaced by the fallback
    pub requested_language: Option<String>,
    pub voice: Option<VoiceReference>,
    /// Registry voice to look up before synthesis
    pub voice_profile_id: Option<String>,
    pub mode: CloneMode,
    pub format: OutputFormat,
}

impl SynthesisRequest {
    pub fn from_input(job_id: &str, input: &JobInput, policy: &RequestPolicy) -> Result<Self> {
        let text = required(&input.text, "text")?;
        let chars = text.chars().count();
        if chars > policy.max_text_chars {
            return Err(SynthesisError::Validation(format!(
                "text is {} characters, limit is {}",
                chars, policy.max_text_chars
            )));
        }

        let (language, requested_language) =
            policy.resolve_language(non_empty(&input.language).unwrap_or("en"))?;

        let url = non_empty(&input.voice_clone_url);
        let transcript = non_empty(&input.voice_clone_text);
        let profile_id = non_empty(&input.voice_profile_id);

        let voice = match (url, transcript) {
            (Some(url), Some(transcript)) => {
                validate_sample_url(url)?;
                Some(VoiceReference::new(url, transcript))
            }
            (Some(_), None) => {
                return Err(SynthesisError::Validation(
                    "'voice_clone_text' is required with 'voice_clone_url'".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(SynthesisError::Validation(
                    "'voice_clone_text' given without 'voice_clone_url'".into(),
                ))
            }
            (None, None) => None,
        };
        if voice.is_some() && profile_id.is_some() {
            return Err(SynthesisError::Validation(
                "'voice_profile_id' and 'voice_clone_url' are mutually exclusive".into(),
            ));
        }

        let mut mode = CloneMode::from_flag(input.use_openvoice);
        if mode == CloneMode::Enhanced && voice.is_none() && profile_id.is_none() {
            warn!(target: "handler", job_id = %job_id, "use_openvoice ignored without a voice reference");
            mode = CloneMode::Base;
        }

        let format = match non_empty(&input.output_format) {
            Some(f) => f.parse::<OutputFormat>().map_err(|bad| {
                SynthesisError::Validation(format!("unsupported output_format '{}'", bad))
            })?,
            None => policy.default_format,
        };

        Ok(Self {
            job_id: job_id.to_string(),
            text: text.to_string(),
            language,
            requested_language,
            voice,
            voice_profile_id: profile_id.map(str::to_string),
            mode,
            format,
        })
    }
}
