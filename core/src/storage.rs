//! Object storage for generated audio
//!
//! Two adapters:
//! - `S3ObjectStorage` signs requests (SigV4) with an access/secret key pair
//!   and addresses buckets path-style, which is what RunPod's S3 endpoint and
//!   most self-hosted stores expect.
//! - `HttpObjectStorage` speaks plain HTTP, `PUT {endpoint}/{bucket}/{key}`
//!   with an optional bearer token, for presigning gateways.
//!
//! `connect` picks S3 when both keys are set, the plain adapter when only an
//! endpoint is. Returned URLs are built from `public_base_url` when set, so
//! buckets fronted by a CDN hand out CDN links.
//!
//! Env overrides:
//! - RUNPOD_S3_ENDPOINT, RUNPOD_S3_BUCKET, RUNPOD_S3_REGION
//! - RUNPOD_S3_ACCESS_KEY, RUNPOD_S3_SECRET_KEY
//! - STORAGE_TOKEN, STORAGE_PREFIX, STORAGE_PUBLIC_URL, STORAGE_TIMEOUT_MS

use crate::error::{Result, SynthesisError};
use crate::utils::{env_parse, env_string};
use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_S3_ENDPOINT: &str = "https://storage.runpod.io";
pub const DEFAULT_BUCKET: &str = "flowsmartly-avatars";

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `key` and return a URL the caller can fetch.
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub region: String,
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Key prefix for generated audio
    pub prefix: String,
    pub public_base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: env_string("RUNPOD_S3_ENDPOINT"),
            bucket: env_string("RUNPOD_S3_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            region: env_string("RUNPOD_S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key: env_string("RUNPOD_S3_ACCESS_KEY"),
            secret_key: env_string("RUNPOD_S3_SECRET_KEY"),
            token: env_string("STORAGE_TOKEN"),
            prefix: env_string("STORAGE_PREFIX").unwrap_or_else(|| "tts".to_string()),
            public_base_url: env_string("STORAGE_PUBLIC_URL"),
            timeout_ms: env_parse("STORAGE_TIMEOUT_MS").unwrap_or(60_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Http,
}

impl StorageConfig {
    pub fn backend(&self) -> Option<StorageBackend> {
        if self.access_key.is_some() && self.secret_key.is_some() {
            Some(StorageBackend::S3)
        } else if self.endpoint.is_some() {
            Some(StorageBackend::Http)
        } else {
            None
        }
    }

    pub fn is_configured(&self) -> bool {
        self.backend().is_some()
    }

    fn public_base(&self) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|u| u.trim_end_matches('/').to_string())
    }
}

/// Build the adapter `config` selects, or `None` when storage is not configured.
pub fn connect(config: &StorageConfig) -> Result<Option<Arc<dyn ObjectStorage>>> {
    let storage: Arc<dyn ObjectStorage> = match config.backend() {
        Some(StorageBackend::S3) => Arc::new(S3ObjectStorage::new(config)?),
        Some(StorageBackend::Http) => Arc::new(HttpObjectStorage::new(config)?),
        None => return Ok(None),
    };
    Ok(Some(storage))
}

/// `{prefix}/{job_id}.{ext}`
pub fn object_key(prefix: &str, job_id: &str, extension: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}.{}", job_id, extension)
    } else {
        format!("{}/{}.{}", prefix, job_id, extension)
    }
}

pub struct HttpObjectStorage {
    endpoint: String,
    bucket: String,
    token: Option<String>,
    public_base_url: Option<String>,
    http_client: reqwest::Client,
}

impl HttpObjectStorage {
    /// Fails with a storage error when no endpoint is set.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let Some(endpoint) = &config.endpoint else {
            return Err(SynthesisError::Storage(
                "object storage is not configured (RUNPOD_S3_ENDPOINT)".into(),
            ));
        };
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SynthesisError::Storage(format!("http client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.trim_matches('/').to_string(),
            token: config.token.clone(),
            public_base_url: config.public_base(),
            http_client,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let url = self.object_url(key);
        let size = bytes.len();
        let mut request = self
            .http_client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SynthesisError::Storage(format!("upload to {} failed: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Storage(format!(
                "upload to {} returned {}: {}",
                url,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let public = match &self.public_base_url {
            Some(base) => format!("{}/{}", base, key),
            None => url,
        };
        info!(target: "storage", key = %key, bytes = size, url = %public, "Uploaded audio");
        Ok(public)
    }
}

/// SigV4-signed uploads to an S3-compatible endpoint.
pub struct S3ObjectStorage {
    bucket: Box<Bucket>,
    object_base: String,
    public_base_url: Option<String>,
}

impl S3ObjectStorage {
    /// Fails with a storage error when either key is missing.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) else {
            return Err(SynthesisError::Storage(
                "S3 credentials not configured (RUNPOD_S3_ACCESS_KEY, RUNPOD_S3_SECRET_KEY)".into(),
            ));
        };
        let endpoint = config
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_S3_ENDPOINT)
            .trim_end_matches('/')
            .to_string();
        let bucket_name = config.bucket.trim_matches('/');

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| SynthesisError::Storage(format!("S3 credentials: {}", e)))?;
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: endpoint.clone(),
        };
        let mut bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| SynthesisError::Storage(format!("S3 bucket {}: {}", bucket_name, e)))?
            .with_path_style();
        bucket.set_request_timeout(Some(Duration::from_millis(config.timeout_ms)));

        Ok(Self {
            bucket,
            object_base: format!("{}/{}", endpoint, bucket_name),
            public_base_url: config.public_base(),
        })
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let url = format!("{}/{}", self.object_base, key);
        let response = self
            .bucket
            .put_object_with_content_type(key, &bytes, content_type)
            .await
            .map_err(|e| SynthesisError::Storage(format!("S3 upload to {} failed: {}", url, e)))?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            let body = String::from_utf8_lossy(response.as_slice());
            return Err(SynthesisError::Storage(format!(
                "S3 upload to {} returned {}: {}",
                url,
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let public = match &self.public_base_url {
            Some(base) => format!("{}/{}", base, key),
            None => url,
        };
        info!(target: "storage", key = %key, bytes = bytes.len(), url = %public, "Uploaded audio to S3");
        Ok(public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_use_prefix() {
        assert_eq!(object_key("tts/", "abc", "mp3"), "tts/abc.mp3");
        assert_eq!(object_key("", "abc", "wav"), "abc.wav");
    }

    fn config() -> StorageConfig {
        StorageConfig {
            endpoint: None,
            bucket: DEFAULT_BUCKET.into(),
            region: "us-east-1".into(),
            access_key: None,
            secret_key: None,
            token: None,
            prefix: "tts".into(),
            public_base_url: None,
            timeout_ms: 1_000,
        }
    }

    #[test]
    fn backend_follows_credentials_then_endpoint() {
        let mut cfg = config();
        assert_eq!(cfg.backend(), None);
        assert!(HttpObjectStorage::new(&cfg).is_err());
        assert!(S3ObjectStorage::new(&cfg).is_err());
        assert!(matches!(connect(&cfg), Ok(None)));

        cfg.endpoint = Some("http://minio:9000".into());
        assert_eq!(cfg.backend(), Some(StorageBackend::Http));

        cfg.access_key = Some("ak".into());
        assert_eq!(cfg.backend(), Some(StorageBackend::Http));
        cfg.secret_key = Some("sk".into());
        assert_eq!(cfg.backend(), Some(StorageBackend::S3));
        assert!(matches!(connect(&cfg), Ok(Some(_))));
    }

    #[test]
    fn public_base_drops_trailing_slash() {
        let mut cfg = config();
        cfg.public_base_url = Some("https://cdn.example.com/".into());
        assert_eq!(cfg.public_base().as_deref(), Some("https://cdn.example.com"));
    }
}
