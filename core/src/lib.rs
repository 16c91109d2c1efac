// voxcast core library
// Serverless speech synthesis orchestration: job handling, voice cloning
// caches and model lifecycle

pub mod audio;
pub mod config;
pub mod error;
pub mod fetch;
pub mod handler;
pub mod language;
pub mod models;
pub mod pipeline;
pub mod request;
pub mod runtime;
pub mod storage;
pub mod telemetry;
pub mod text;
pub mod voice;

mod utils;

// Export core types
pub use audio::{AudioBuffer, AudioEncoder, EncodedAudio, OutputFormat};
pub use config::WorkerConfig;
pub use error::{ErrorKind, Result, SynthesisError};
pub use fetch::{AudioFetcher, FetchConfig, HttpAudioFetcher, ReferenceSample, SampleBounds, SampleLoader};
pub use handler::{HandlerConfig, JobHandler, JobResponse, OutputMode};
pub use language::Language;
pub use models::{
    CliModelLoader, ModelHandle, ModelKind, ModelLoader, ModelPool, ModelPoolConfig, SpeechModel,
    VoiceCloningModel, VoiceEmbedding,
};
pub use pipeline::{PipelineConfig, Stage, SynthesisPipeline};
pub use request::{Job, JobInput, RequestPolicy, SynthesisRequest};
pub use runtime::{run_worker, FileJobSource, HttpJobSource, JobPoll, JobSource, RuntimeConfig};
pub use storage::{
    HttpObjectStorage, ObjectStorage, S3ObjectStorage, StorageBackend, StorageConfig,
};
pub use telemetry::JobMetrics;
pub use utils::gen_job_id;
pub use voice::{
    CloneMode, Fingerprint, VoiceCacheConfig, VoiceProfile, VoiceProfileCache, VoiceReference,
    VoiceRegistry,
};
