use super::{ModelHandle, ModelKind, ModelLoader, SpeechModel, VoiceCloningModel};
use crate::error::{Result, SynthesisError};
use crate::utils::{elapsed_ms, env_flag, env_parse};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPoolConfig {
    /// How long a failed load is served from cache before one more attempt
    pub retry_after_secs: u64,
    /// Warm both models at worker start instead of on first use
    pub preload: bool,
}

impl Default for ModelPoolConfig {
    fn default() -> Self {
        Self {
            retry_after_secs: env_parse("MODEL_RETRY_AFTER_SECS").unwrap_or(60),
            preload: env_flag("PRELOAD_MODELS").unwrap_or(false),
        }
    }
}

/// Observable state of one model slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelStatus {
    Uninitialized,
    Loading,
    Ready { name: String },
    Failed { message: String, attempts: u32 },
}

enum SlotState {
    Uninitialized,
    Ready(ModelHandle),
    Failed {
        error: SynthesisError,
        failed_at: Instant,
        attempts: u32,
    },
}

struct Slot {
    state: Mutex<SlotState>,
    // Snapshot for `status`, readable while a load holds `state`
    status: StdMutex<ModelStatus>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Uninitialized),
            status: StdMutex::new(ModelStatus::Uninitialized),
        }
    }

    fn publish(&self, status: ModelStatus) -> ModelStatus {
        let mut current = self.status.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *current, status)
    }

    fn snapshot(&self) -> ModelStatus {
        self.status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Marks a slot `Loading` for the duration of one loader call and puts the
/// previous status back if the load is dropped before it settles.
struct LoadingMark<'a> {
    slot: &'a Slot,
    previous: Option<ModelStatus>,
}

impl<'a> LoadingMark<'a> {
    fn new(slot: &'a Slot) -> Self {
        let previous = slot.publish(ModelStatus::Loading);
        Self {
            slot,
            previous: Some(previous),
        }
    }

    fn settle(mut self, status: ModelStatus) {
        self.previous = None;
        self.slot.publish(status);
    }
}

impl Drop for LoadingMark<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.slot.publish(previous);
        }
    }
}

fn failed_status(error: &SynthesisError, attempts: u32) -> ModelStatus {
    ModelStatus::Failed {
        message: error.to_string(),
        attempts,
    }
}

/// Owner of the process-wide model handles
///
/// Each kind has one slot guarded by an async mutex. The caller that finds a
/// slot empty loads it while holding the lock, so concurrent callers queue
/// behind that single load and then observe either a ready handle or the
/// cached failure. A handle is published only after its loader returned, so
/// no caller sees a half-built model. Dropping an in-progress load (job
/// timeout) leaves the slot as it was.
pub struct ModelPool {
    loader: Arc<dyn ModelLoader>,
    speech: Slot,
    cloning: Slot,
    gpu: Arc<Semaphore>,
    retry_after: Duration,
}

impl ModelPool {
    pub fn new(loader: Arc<dyn ModelLoader>, config: ModelPoolConfig) -> Self {
        Self {
            loader,
            speech: Slot::new(),
            cloning: Slot::new(),
            gpu: Arc::new(Semaphore::new(1)),
            retry_after: Duration::from_secs(config.retry_after_secs),
        }
    }

    fn slot(&self, kind: ModelKind) -> &Slot {
        match kind {
            ModelKind::Speech => &self.speech,
            ModelKind::VoiceCloning => &self.cloning,
        }
    }

    /// Return the ready handle for `kind`, loading it on first use.
    #[tracing::instrument(skip(self))]
    pub async fn ensure(&self, kind: ModelKind) -> Result<ModelHandle> {
        let slot = self.slot(kind);
        let mut state = slot.state.lock().await;

        let attempts = match &*state {
            SlotState::Ready(handle) => return Ok(handle.clone()),
            SlotState::Failed {
                error,
                failed_at,
                attempts,
            } => {
                if failed_at.elapsed() < self.retry_after {
                    return Err(error.clone());
                }
                info!(target: "model_pool", kind = %kind, attempts, "Retrying failed model load");
                *attempts
            }
            SlotState::Uninitialized => 0,
        };

        info!(target: "model_pool", kind = %kind, "Loading model (cold start)");
        let start = Instant::now();
        let mark = LoadingMark::new(slot);
        let loaded = match kind {
            ModelKind::Speech => self.loader.load_speech().await.map(ModelHandle::Speech),
            ModelKind::VoiceCloning => self
                .loader
                .load_voice_cloning()
                .await
                .map(ModelHandle::VoiceCloning),
        };

        match loaded {
            Ok(handle) => {
                info!(
                    target: "model_pool",
                    kind = %kind,
                    model = handle.name(),
                    elapsed_ms = elapsed_ms(start),
                    "Model ready"
                );
                *state = SlotState::Ready(handle.clone());
                mark.settle(ModelStatus::Ready {
                    name: handle.name().to_string(),
                });
                Ok(handle)
            }
            Err(e) => {
                let error = if matches!(e, SynthesisError::ModelLoad { .. }) {
                    e
                } else {
                    SynthesisError::ModelLoad {
                        model: kind.to_string(),
                        message: e.to_string(),
                    }
                };
                warn!(
                    target: "model_pool",
                    kind = %kind,
                    error = %error,
                    retry_after_s = self.retry_after.as_secs(),
                    "Model load failed; marking unavailable"
                );
                *state = SlotState::Failed {
                    error: error.clone(),
                    failed_at: Instant::now(),
                    attempts: attempts + 1,
                };
                mark.settle(failed_status(&error, attempts + 1));
                Err(error)
            }
        }
    }

    pub async fn speech(&self) -> Result<Arc<dyn SpeechModel>> {
        match self.ensure(ModelKind::Speech).await? {
            ModelHandle::Speech(m) => Ok(m),
            ModelHandle::VoiceCloning(_) => Err(SynthesisError::Internal(
                "speech slot holds a voice cloning model".into(),
            )),
        }
    }

    pub async fn voice_cloning(&self) -> Result<Arc<dyn VoiceCloningModel>> {
        match self.ensure(ModelKind::VoiceCloning).await? {
            ModelHandle::VoiceCloning(m) => Ok(m),
            ModelHandle::Speech(_) => Err(SynthesisError::Internal(
                "voice cloning slot holds a speech model".into(),
            )),
        }
    }

    /// Clear a cached load failure so the next `ensure` retries immediately.
    /// Ready handles are never torn down; returns whether a failure was cleared.
    pub async fn reset(&self, kind: ModelKind) -> bool {
        let slot = self.slot(kind);
        let mut state = slot.state.lock().await;
        if matches!(&*state, SlotState::Failed { .. }) {
            info!(target: "model_pool", kind = %kind, "Resetting failed model slot");
            *state = SlotState::Uninitialized;
            slot.publish(ModelStatus::Uninitialized);
            return true;
        }
        false
    }

    /// Current state of a slot. `Loading` only while a loader call is in flight.
    pub fn status(&self, kind: ModelKind) -> ModelStatus {
        self.slot(kind).snapshot()
    }

    /// Exclusive GPU lane: one inference or derivation at a time per process.
    pub async fn exclusive(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.gpu)
            .acquire_owned()
            .await
            .map_err(|_| SynthesisError::Internal("GPU lane closed".into()))
    }

    /// Warm both models; failures are logged and left to lazy retry.
    pub async fn preload(&self) {
        for kind in [ModelKind::Speech, ModelKind::VoiceCloning] {
            if let Err(e) = self.ensure(kind).await {
                warn!(target: "model_pool", kind = %kind, error = %e, "Preload failed; will load on first request");
            }
        }
    }
}
