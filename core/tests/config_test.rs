use serial_test::serial;
use voxcast_core::{Language, OutputFormat, OutputMode, StorageBackend, WorkerConfig};

const VARS: &[&str] = &[
    "VOXCAST_CONFIG",
    "EXECUTION_TIMEOUT_MS",
    "SUPPORTED_LANGUAGES",
    "FALLBACK_LANGUAGE",
    "OUTPUT_MODE",
    "OUTPUT_FORMAT",
    "TARGET_RMS",
    "STRICT_CONVERSION",
    "VOICE_CACHE_CAPACITY",
    "VOICE_CACHE_TTL_SECS",
    "PRELOAD_MODELS",
    "RUNPOD_S3_ENDPOINT",
    "RUNPOD_S3_BUCKET",
    "RUNPOD_S3_REGION",
    "RUNPOD_S3_ACCESS_KEY",
    "RUNPOD_S3_SECRET_KEY",
    "STORAGE_TOKEN",
    "OPENVOICE_SCRIPT",
    "RUNPOD_WEBHOOK_GET_JOB",
    "RUNPOD_WEBHOOK_POST_OUTPUT",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn defaults_without_env() {
    clear_env();

    let cfg = WorkerConfig::load_from(std::path::Path::new("/nonexistent/voxcast.toml"));
    assert_eq!(cfg.execution_timeout_ms, 300_000);
    assert_eq!(cfg.supported_languages, Language::ALL.to_vec());
    assert_eq!(cfg.fallback_language, None);
    assert_eq!(cfg.output_mode, OutputMode::Auto);
    assert_eq!(cfg.output_format, OutputFormat::Mp3);
    assert_eq!(cfg.target_rms, Some(0.1));
    assert!(!cfg.strict_conversion);
    assert_eq!(cfg.voice_cache.capacity, 32);
    assert_eq!(cfg.voice_cache.ttl_secs, 3600);
    assert!(!cfg.models.preload);
    assert!(!cfg.storage.is_configured());
    assert_eq!(cfg.storage.bucket, "flowsmartly-avatars");
    assert!(cfg.cloning.script.is_none());
    assert!(!cfg.runtime.has_webhooks());
}

#[test]
#[serial]
fn env_overrides_defaults() {
    clear_env();
    std::env::set_var("EXECUTION_TIMEOUT_MS", "1500");
    std::env::set_var("SUPPORTED_LANGUAGES", "en, zh-CN, klingon");
    std::env::set_var("FALLBACK_LANGUAGE", "en");
    std::env::set_var("OUTPUT_MODE", "inline");
    std::env::set_var("OUTPUT_FORMAT", "wav");
    std::env::set_var("TARGET_RMS", "0");
    std::env::set_var("STRICT_CONVERSION", "yes");
    std::env::set_var("VOICE_CACHE_CAPACITY", "3");
    std::env::set_var("PRELOAD_MODELS", "1");
    std::env::set_var("RUNPOD_S3_ENDPOINT", "https://s3.example.com");
    std::env::set_var("RUNPOD_S3_BUCKET", "audio");

    let cfg = WorkerConfig::load_from(std::path::Path::new("/nonexistent/voxcast.toml"));
    assert_eq!(cfg.execution_timeout_ms, 1500);
    assert_eq!(cfg.supported_languages, vec![Language::En, Language::Zh]);
    assert_eq!(cfg.fallback_language, Some(Language::En));
    assert_eq!(cfg.output_mode, OutputMode::Inline);
    assert_eq!(cfg.output_format, OutputFormat::Wav);
    assert_eq!(cfg.target_rms, None);
    assert!(cfg.strict_conversion);
    assert_eq!(cfg.voice_cache.capacity, 3);
    assert!(cfg.models.preload);
    assert_eq!(cfg.storage.backend(), Some(StorageBackend::Http));
    assert_eq!(cfg.storage.bucket, "audio");

    let policy = cfg.request_policy();
    assert_eq!(policy.default_format, OutputFormat::Wav);
    assert_eq!(cfg.handler_config().execution_timeout_ms, 1500);
    assert!(cfg.pipeline_config().strict_conversion);

    clear_env();
}

#[test]
#[serial]
fn toml_file_overlays_env() {
    clear_env();
    std::env::set_var("EXECUTION_TIMEOUT_MS", "1500");
    std::env::set_var("VOICE_CACHE_TTL_SECS", "60");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("voxcast.toml");
    std::fs::write(
        &path,
        r#"
            execution_timeout_ms = 9000
            output_mode = "upload"

            [cache]
            capacity = 5

            [runtime]
            poll_interval_ms = 250
        "#,
    )
    .expect("write config");
    std::env::set_var("VOXCAST_CONFIG", &path);

    let cfg = WorkerConfig::load();
    assert_eq!(cfg.execution_timeout_ms, 9000);
    assert_eq!(cfg.output_mode, OutputMode::Upload);
    assert_eq!(cfg.voice_cache.capacity, 5);
    assert_eq!(cfg.voice_cache.ttl_secs, 60);
    assert_eq!(cfg.runtime.poll_interval_ms, 250);

    clear_env();
}

#[test]
#[serial]
fn malformed_toml_falls_back_to_env() {
    clear_env();
    std::env::set_var("EXECUTION_TIMEOUT_MS", "4200");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("voxcast.toml");
    std::fs::write(&path, "execution_timeout_ms = [oops").expect("write config");

    let cfg = WorkerConfig::load_from(&path);
    assert_eq!(cfg.execution_timeout_ms, 4200);

    clear_env();
}

#[test]
#[serial]
fn s3_credentials_select_signed_storage() {
    clear_env();
    std::env::set_var("RUNPOD_S3_ACCESS_KEY", "ak");
    std::env::set_var("RUNPOD_S3_SECRET_KEY", "sk");

    let cfg = WorkerConfig::load_from(std::path::Path::new("/nonexistent/voxcast.toml"));
    assert_eq!(cfg.storage.backend(), Some(StorageBackend::S3));
    assert_eq!(cfg.storage.endpoint, None);
    assert_eq!(cfg.storage.bucket, "flowsmartly-avatars");
    assert_eq!(cfg.storage.region, "us-east-1");
    assert!(voxcast_core::storage::connect(&cfg.storage)
        .expect("s3 client")
        .is_some());

    clear_env();
}
