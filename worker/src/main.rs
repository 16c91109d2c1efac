use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use voxcast_core::fetch::HttpAudioFetcher;
use voxcast_core::storage;
use voxcast_core::{
    run_worker, AudioEncoder, CliModelLoader, FileJobSource, HttpJobSource, JobHandler,
    ModelKind, ModelPool, OutputMode, SampleLoader, SynthesisPipeline, VoiceProfileCache,
    VoiceRegistry, WorkerConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,voxcast_core=info,voxcast_worker=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // Load configuration (env defaults + optional TOML overlay)
    let cfg = WorkerConfig::load();
    info!(
        target: "voxcast_worker",
        languages = ?cfg.supported_languages,
        fallback = ?cfg.fallback_language,
        timeout_ms = cfg.execution_timeout_ms,
        output_mode = ?cfg.output_mode,
        "Starting voxcast worker"
    );

    let loader = Arc::new(CliModelLoader {
        speech: cfg.speech.clone(),
        cloning: cfg.cloning.clone(),
    });
    let models = Arc::new(ModelPool::new(loader, cfg.models.clone()));

    let encoder = AudioEncoder::new(cfg.ffmpeg_bin.clone());
    if !encoder.has_ffmpeg() {
        warn!(target: "voxcast_worker", "ffmpeg not found; mp3 output and non-WAV voice samples are unavailable");
    }

    let fetcher = Arc::new(HttpAudioFetcher::new(cfg.fetch.clone()));
    let samples = SampleLoader::new(fetcher, encoder.clone(), cfg.sample);
    let voices = Arc::new(VoiceProfileCache::new(
        samples,
        Arc::clone(&models),
        cfg.voice_cache.clone(),
    ));
    let pipeline = Arc::new(SynthesisPipeline::new(
        Arc::clone(&models),
        voices,
        encoder,
        cfg.pipeline_config(),
    ));
    let registry = Arc::new(VoiceRegistry::open(&cfg.voices_dir).await?);

    let mut handler = JobHandler::new(pipeline, cfg.handler_config()).with_registry(registry);
    if let Some(storage) = storage::connect(&cfg.storage)? {
        info!(target: "voxcast_worker", backend = ?cfg.storage.backend(), bucket = %cfg.storage.bucket, "Object storage configured");
        handler = handler.with_storage(storage, cfg.storage.prefix.clone());
    } else if cfg.output_mode == OutputMode::Upload {
        warn!(target: "voxcast_worker", "OUTPUT_MODE=upload but object storage is not configured; synthesis jobs will fail");
    }

    if cfg.models.preload {
        models.preload().await;
        for kind in [ModelKind::Speech, ModelKind::VoiceCloning] {
            info!(target: "voxcast_worker", kind = %kind, status = ?models.status(kind), "Model status");
        }
    }

    // Ctrl+C flips the shutdown flag; the job in progress is finished first
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!(target: "voxcast_worker", "Shutting down...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(target: "voxcast_worker", error = %e, "Failed to install Ctrl+C handler");
                // Keep the sender alive so the worker loop is not told to stop
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    if cfg.runtime.has_webhooks() {
        let source = HttpJobSource::new(&cfg.runtime)?;
        run_worker(&source, &handler, &cfg.runtime, shutdown_rx).await;
    } else if cfg.runtime.test_input.exists() {
        let source = FileJobSource::new(cfg.runtime.test_input.clone());
        run_worker(&source, &handler, &cfg.runtime, shutdown_rx).await;
        if let Some(output) = source.output() {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    } else {
        return Err(format!(
            "no job source: set RUNPOD_WEBHOOK_GET_JOB and RUNPOD_WEBHOOK_POST_OUTPUT, or provide {}",
            cfg.runtime.test_input.display()
        )
        .into());
    }

    Ok(())
}
