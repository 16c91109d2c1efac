//! Reference voice sample retrieval
//!
//! `HttpAudioFetcher` downloads bytes with content-type and size checks and a
//! small bounded retry for transient network failures. `SampleLoader` turns
//! those bytes into a validated mono `ReferenceSample`: decoded (WAV natively,
//! other containers through ffmpeg), inside the configured duration window,
//! and content-hashed for fingerprinting.
//!
//! Env overrides:
//! - FETCH_TIMEOUT_MS, FETCH_RETRIES, FETCH_RETRY_BACKOFF_MS
//! - MIN_SAMPLE_SECONDS, MAX_SAMPLE_SECONDS, MAX_SAMPLE_BYTES

use crate::audio::{wav, AudioBuffer, AudioEncoder};
use crate::error::{Result, SynthesisError};
use crate::utils::env_parse;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Raw byte retrieval; the seam tests replace.
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    /// Extra attempts after the first one, transient failures only
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub max_bytes: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: env_parse("FETCH_TIMEOUT_MS").unwrap_or(60_000),
            retries: env_parse("FETCH_RETRIES").unwrap_or(2),
            retry_backoff_ms: env_parse("FETCH_RETRY_BACKOFF_MS").unwrap_or(500),
            max_bytes: env_parse("MAX_SAMPLE_BYTES").unwrap_or(20 * 1024 * 1024),
            user_agent: "voxcast-worker/0.1".to_string(),
        }
    }
}

pub struct HttpAudioFetcher {
    config: FetchConfig,
    http_client: reqwest::Client,
}

impl HttpAudioFetcher {
    pub fn new(config: FetchConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(&config.user_agent)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            http_client,
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self.http_client.get(url).send().await.map_err(|e| {
            let msg = format!("request to {} failed: {}", url, e);
            if e.is_timeout() || e.is_connect() || e.is_request() {
                SynthesisError::fetch_transient(msg)
            } else {
                SynthesisError::fetch(msg)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let msg = format!("{} returned status {}", url, status);
            return Err(
                if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    SynthesisError::fetch_transient(msg)
                } else {
                    SynthesisError::fetch(msg)
                },
            );
        }

        if let Some(ct) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !is_audio_content_type(ct) {
                return Err(SynthesisError::fetch(format!(
                    "unexpected content type '{}' for voice sample",
                    ct
                )));
            }
        }

        let max = self.config.max_bytes;
        if let Some(len) = response.content_length() {
            if len as usize > max {
                return Err(SynthesisError::fetch(format!(
                    "voice sample is {} bytes, limit is {}",
                    len, max
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| SynthesisError::fetch_transient(format!("reading body failed: {}", e)))?
        {
            if body.len() + chunk.len() > max {
                return Err(SynthesisError::fetch(format!(
                    "voice sample exceeds {} bytes",
                    max
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl AudioFetcher for HttpAudioFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut attempt = 0u32;
        loop {
            debug!(target: "fetch", url = %url, attempt, "Downloading voice sample");
            match self.fetch_once(url).await {
                Ok(bytes) => {
                    info!(target: "fetch", url = %url, bytes = bytes.len(), "Downloaded voice sample");
                    return Ok(bytes);
                }
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!(target: "fetch", url = %url, attempt, error = %e, "Transient fetch failure, retrying");
                    tokio::time::sleep(Duration::from_millis(
                        self.config.retry_backoff_ms * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_audio_content_type(ct: &str) -> bool {
    let mime = ct
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime.is_empty()
        || mime.starts_with("audio/")
        || mime.starts_with("video/")
        || mime == "application/octet-stream"
        || mime == "binary/octet-stream"
        || mime == "application/ogg"
}

/// Accepted duration window for reference samples.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SampleBounds {
    pub min_seconds: f64,
    pub max_seconds: f64,
}

impl Default for SampleBounds {
    fn default() -> Self {
        Self {
            min_seconds: env_parse("MIN_SAMPLE_SECONDS").unwrap_or(1.0),
            max_seconds: env_parse("MAX_SAMPLE_SECONDS").unwrap_or(30.0),
        }
    }
}

/// A downloaded, decoded and validated reference clip.
#[derive(Debug, Clone)]
pub struct ReferenceSample {
    pub source_url: String,
    /// Hex SHA-256 of the bytes as downloaded
    pub content_hash: String,
    pub audio: AudioBuffer,
    /// `audio` re-encoded as mono PCM16 WAV
    pub wav_bytes: Vec<u8>,
}

impl ReferenceSample {
    pub fn duration_secs(&self) -> f64 {
        self.audio.duration_secs()
    }
}

pub struct SampleLoader {
    fetcher: Arc<dyn AudioFetcher>,
    encoder: AudioEncoder,
    bounds: SampleBounds,
}

impl SampleLoader {
    pub fn new(fetcher: Arc<dyn AudioFetcher>, encoder: AudioEncoder, bounds: SampleBounds) -> Self {
        Self {
            fetcher,
            encoder,
            bounds,
        }
    }

    pub async fn load(&self, url: &str) -> Result<ReferenceSample> {
        let raw = self.fetcher.fetch(url).await?;
        if raw.is_empty() {
            return Err(SynthesisError::fetch(format!("{} returned an empty body", url)));
        }
        let content_hash = format!("{:x}", Sha256::digest(&raw));

        let audio = if wav::is_wav(&raw) {
            wav::decode(&raw)
                .map_err(|e| SynthesisError::fetch(format!("undecodable WAV sample: {}", e)))?
        } else if self.encoder.has_ffmpeg() {
            let converted = self
                .encoder
                .transcode_to_wav(raw)
                .await
                .map_err(|e| SynthesisError::fetch(format!("undecodable voice sample: {}", e)))?;
            wav::decode(&converted)
                .map_err(|e| SynthesisError::fetch(format!("undecodable voice sample: {}", e)))?
        } else {
            return Err(SynthesisError::fetch(
                "voice sample is not WAV and ffmpeg is unavailable to convert it",
            ));
        };

        let duration = audio.duration_secs();
        if duration < self.bounds.min_seconds || duration > self.bounds.max_seconds {
            return Err(SynthesisError::fetch(format!(
                "voice sample is {:.2}s, expected between {:.1}s and {:.1}s",
                duration, self.bounds.min_seconds, self.bounds.max_seconds
            )));
        }

        let wav_bytes = wav::encode_pcm16(&audio)?;
        debug!(target: "fetch", url = %url, duration_s = duration, hash = %content_hash, "Reference sample validated");
        Ok(ReferenceSample {
            source_url: url.to_string(),
            content_hash,
            audio,
            wav_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_filter() {
        assert!(is_audio_content_type("audio/wav"));
        assert!(is_audio_content_type("audio/mpeg; charset=binary"));
        assert!(is_audio_content_type("application/octet-stream"));
        assert!(!is_audio_content_type("text/html; charset=utf-8"));
        assert!(!is_audio_content_type("application/json"));
    }
}
