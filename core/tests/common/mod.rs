#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use voxcast_core::audio::wav;
use voxcast_core::handler::HandlerConfig;
use voxcast_core::{
    AudioBuffer, AudioEncoder, AudioFetcher, JobHandler, Language, ModelLoader, ModelPool,
    ModelPoolConfig, ObjectStorage, PipelineConfig, ReferenceSample, Result, SampleBounds,
    SampleLoader, SpeechModel, SynthesisError, SynthesisPipeline, VoiceCacheConfig,
    VoiceCloningModel, VoiceEmbedding, VoiceProfile, VoiceProfileCache,
};

pub const SPEECH_RATE: u32 = 24_000;

/// Mono PCM16 WAV with a sine tone; different tones give different content hashes.
pub fn sample_wav(seconds: f64, tone_hz: f32) -> Vec<u8> {
    let rate = 16_000u32;
    let n = (seconds * rate as f64) as usize;
    let samples = (0..n)
        .map(|i| 0.3 * (2.0 * std::f32::consts::PI * tone_hz * i as f32 / rate as f32).sin())
        .collect();
    wav::encode_pcm16(&AudioBuffer::new(samples, rate)).expect("encode test wav")
}

// Mock fetcher serving registered URLs, counting calls
#[derive(Default)]
pub struct MockFetcher {
    samples: Mutex<HashMap<String, Vec<u8>>>,
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl MockFetcher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.samples.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.samples
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| SynthesisError::fetch(format!("{} returned status 404 Not Found", url)))
    }
}

// Speech model that produces a short tone and tracks GPU-lane overlap.
// Text containing "PANIC" panics, text containing "OOM" fails transiently.
#[derive(Default)]
pub struct MockSpeech {
    pub embeds: AtomicUsize,
    pub generations: AtomicUsize,
    pub delay: Duration,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

#[async_trait]
impl SpeechModel for MockSpeech {
    fn name(&self) -> &'static str {
        "mock-speech"
    }

    async fn embed_reference(&self, sample: &ReferenceSample, _transcript: &str) -> Result<VoiceEmbedding> {
        self.embeds.fetch_add(1, Ordering::SeqCst);
        Ok(VoiceEmbedding::new("mock/reference", sample.wav_bytes.clone()))
    }

    async fn generate(
        &self,
        text: &str,
        _language: Language,
        _voice: Option<&VoiceProfile>,
    ) -> Result<AudioBuffer> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if text.contains("PANIC") {
            panic!("speech model crashed");
        }
        if text.contains("OOM") {
            return Err(SynthesisError::inference("CUDA out of memory", true));
        }
        Ok(AudioBuffer::new(vec![0.25; SPEECH_RATE as usize / 2], SPEECH_RATE))
    }
}

#[derive(Default)]
pub struct MockCloning {
    pub derives: AtomicUsize,
    pub conversions: AtomicUsize,
    pub fail_derive: AtomicBool,
    pub fail_convert: AtomicBool,
}

#[async_trait]
impl VoiceCloningModel for MockCloning {
    fn name(&self) -> &'static str {
        "mock-openvoice"
    }

    async fn derive_profile(&self, _sample: &ReferenceSample, _transcript: &str) -> Result<VoiceEmbedding> {
        self.derives.fetch_add(1, Ordering::SeqCst);
        if self.fail_derive.load(Ordering::SeqCst) {
            return Err(SynthesisError::inference("tone color extraction failed", false));
        }
        Ok(VoiceEmbedding::new("mock/tone-color", vec![1, 2, 3]))
    }

    async fn convert_timbre(&self, audio: &AudioBuffer, _target: &VoiceEmbedding) -> Result<AudioBuffer> {
        self.conversions.fetch_add(1, Ordering::SeqCst);
        if self.fail_convert.load(Ordering::SeqCst) {
            return Err(SynthesisError::inference("converter crashed", false));
        }
        Ok(audio.clone())
    }
}

// Loader counting loads per kind; failures are toggled at runtime
#[derive(Default)]
pub struct MockLoader {
    pub speech: Arc<MockSpeech>,
    pub cloning: Arc<MockCloning>,
    pub speech_loads: AtomicUsize,
    pub cloning_loads: AtomicUsize,
    pub fail_speech: AtomicBool,
    pub fail_cloning: AtomicBool,
    pub load_delay: Duration,
}

impl MockLoader {
    pub fn speech_loads(&self) -> usize {
        self.speech_loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for MockLoader {
    async fn load_speech(&self) -> Result<Arc<dyn SpeechModel>> {
        self.speech_loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.fail_speech.load(Ordering::SeqCst) {
            return Err(SynthesisError::ModelLoad {
                model: "mock-speech".into(),
                message: "weights missing".into(),
            });
        }
        Ok(self.speech.clone())
    }

    async fn load_voice_cloning(&self) -> Result<Arc<dyn VoiceCloningModel>> {
        self.cloning_loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.fail_cloning.load(Ordering::SeqCst) {
            return Err(SynthesisError::ModelLoad {
                model: "mock-openvoice".into(),
                message: "checkpoint missing".into(),
            });
        }
        Ok(self.cloning.clone())
    }
}

// In-memory object storage
#[derive(Default)]
pub struct MemoryStorage {
    pub objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("mem://{}", key))
    }
}

pub struct HarnessOptions {
    pub cache: VoiceCacheConfig,
    pub strict_conversion: bool,
    pub retry_after_secs: u64,
    pub speech_delay: Duration,
    pub fetch_delay: Duration,
    pub load_delay: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            cache: VoiceCacheConfig {
                capacity: 8,
                ttl_secs: 3600,
            },
            strict_conversion: false,
            retry_after_secs: 60,
            speech_delay: Duration::ZERO,
            fetch_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
        }
    }
}

/// Fully wired core on top of the mocks
pub struct Harness {
    pub loader: Arc<MockLoader>,
    pub fetcher: Arc<MockFetcher>,
    pub models: Arc<ModelPool>,
    pub voices: Arc<VoiceProfileCache>,
    pub pipeline: Arc<SynthesisPipeline>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(HarnessOptions::default())
    }

    pub fn with(opts: HarnessOptions) -> Self {
        let speech = Arc::new(MockSpeech {
            delay: opts.speech_delay,
            ..MockSpeech::default()
        });
        let loader = Arc::new(MockLoader {
            speech,
            load_delay: opts.load_delay,
            ..MockLoader::default()
        });
        let models = Arc::new(ModelPool::new(
            loader.clone(),
            ModelPoolConfig {
                retry_after_secs: opts.retry_after_secs,
                preload: false,
            },
        ));
        let fetcher = Arc::new(MockFetcher::with_delay(opts.fetch_delay));
        let samples = SampleLoader::new(
            fetcher.clone(),
            AudioEncoder::new(None),
            SampleBounds {
                min_seconds: 1.0,
                max_seconds: 30.0,
            },
        );
        let voices = Arc::new(VoiceProfileCache::new(samples, models.clone(), opts.cache));
        let pipeline = Arc::new(SynthesisPipeline::new(
            models.clone(),
            voices.clone(),
            AudioEncoder::new(None),
            PipelineConfig {
                strict_conversion: opts.strict_conversion,
                target_rms: None,
            },
        ));
        Self {
            loader,
            fetcher,
            models,
            voices,
            pipeline,
        }
    }

    pub fn speech(&self) -> &MockSpeech {
        &self.loader.speech
    }

    pub fn cloning(&self) -> &MockCloning {
        &self.loader.cloning
    }

    pub fn handler(&self, config: HandlerConfig) -> JobHandler {
        JobHandler::new(self.pipeline.clone(), config)
    }
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
