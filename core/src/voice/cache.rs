//! Voice profile cache
//!
//! Profiles are stored by content `Fingerprint` in an LRU with an idle TTL.
//! Requests are first looked up by their `RequestKey` (URL, transcript,
//! mode), which aliases a fingerprint once the sample behind that URL has
//! been seen, so a repeat request costs neither a download nor a model call.
//!
//! Concurrent misses converge on one computation per request key and, after
//! the download, one derivation per fingerprint. Failures are handed to every
//! waiter and then forgotten. If the task driving a computation is dropped,
//! one of the waiters runs it instead.

use super::profile::{CloneMode, Fingerprint, RequestKey, VoiceProfile, VoiceReference};
use crate::error::Result;
use crate::fetch::{ReferenceSample, SampleLoader};
use crate::models::ModelPool;
use crate::utils::{elapsed_ms, env_parse};
use dashmap::DashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceCacheConfig {
    /// Maximum number of profiles kept
    pub capacity: usize,
    /// Idle time after which a profile is dropped; 0 disables expiry
    pub ttl_secs: u64,
}

impl Default for VoiceCacheConfig {
    fn default() -> Self {
        Self {
            capacity: env_parse("VOICE_CACHE_CAPACITY").unwrap_or(32),
            ttl_secs: env_parse("VOICE_CACHE_TTL_SECS").unwrap_or(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub derivations: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    derivations: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

struct Entry {
    profile: Arc<VoiceProfile>,
    last_access: Instant,
}

struct CacheState {
    profiles: LruCache<Fingerprint, Entry>,
    aliases: LruCache<RequestKey, Fingerprint>,
}

type Flight = Arc<OnceCell<Result<Arc<VoiceProfile>>>>;

pub struct VoiceProfileCache {
    state: Mutex<CacheState>,
    by_request: DashMap<RequestKey, Flight>,
    by_fingerprint: DashMap<Fingerprint, Flight>,
    loader: SampleLoader,
    models: Arc<ModelPool>,
    ttl: Option<Duration>,
    counters: Counters,
}

impl VoiceProfileCache {
    pub fn new(loader: SampleLoader, models: Arc<ModelPool>, config: VoiceCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        let alias_capacity =
            NonZeroUsize::new(capacity.get().saturating_mul(4)).unwrap_or(capacity);
        Self {
            state: Mutex::new(CacheState {
                profiles: LruCache::new(capacity),
                aliases: LruCache::new(alias_capacity),
            }),
            by_request: DashMap::new(),
            by_fingerprint: DashMap::new(),
            loader,
            models,
            ttl: (config.ttl_secs > 0).then(|| Duration::from_secs(config.ttl_secs)),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the profile for `reference` in `mode`, deriving it on a miss.
    #[tracing::instrument(skip(self, reference), fields(url = %reference.url, mode = mode.as_str()))]
    pub async fn resolve(
        &self,
        reference: &VoiceReference,
        mode: CloneMode,
    ) -> Result<Arc<VoiceProfile>> {
        let key = RequestKey::new(reference, mode);
        if let Some(profile) = self.lookup_alias(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(target: "voice_cache", profile = %profile.id, "Voice profile hit");
            return Ok(profile);
        }

        let flight = self
            .by_request
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();
        let result = flight
            .get_or_init(|| self.resolve_miss(&key, reference, mode))
            .await
            .clone();
        self.by_request.remove_if(&key, |_, f| Arc::ptr_eq(f, &flight));
        result
    }

    async fn resolve_miss(
        &self,
        key: &RequestKey,
        reference: &VoiceReference,
        mode: CloneMode,
    ) -> Result<Arc<VoiceProfile>> {
        // Another flight for this key may have finished between our lookup
        // and joining this one.
        if let Some(profile) = self.lookup_alias(key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(profile);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        // An unavailable cloning model fails fast, before any download.
        if mode == CloneMode::Enhanced {
            self.models.voice_cloning().await?;
        }
        let sample = self.loader.load(&reference.url).await?;
        let fingerprint = Fingerprint::compute(&sample.content_hash, &reference.transcript, mode);

        if let Some(profile) = self.lookup_fingerprint(&fingerprint) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            info!(target: "voice_cache", fingerprint = %fingerprint, url = %reference.url, "Sample matches a cached profile");
            self.lock().aliases.put(key.clone(), fingerprint);
            return Ok(profile);
        }

        let flight = self
            .by_fingerprint
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();
        let result = flight
            .get_or_init(|| self.derive(&fingerprint, &sample, reference, mode))
            .await
            .clone();
        self.by_fingerprint
            .remove_if(&fingerprint, |_, f| Arc::ptr_eq(f, &flight));

        if result.is_ok() {
            self.lock().aliases.put(key.clone(), fingerprint);
        }
        result
    }

    async fn derive(
        &self,
        fingerprint: &Fingerprint,
        sample: &ReferenceSample,
        reference: &VoiceReference,
        mode: CloneMode,
    ) -> Result<Arc<VoiceProfile>> {
        if let Some(profile) = self.lookup_fingerprint(fingerprint) {
            return Ok(profile);
        }

        let start = Instant::now();
        let _lane = self.models.exclusive().await?;
        let speech = self.models.speech().await?;
        let cloning = match mode {
            CloneMode::Base => None,
            CloneMode::Enhanced => Some(self.models.voice_cloning().await?),
        };
        let conditioning = speech.embed_reference(sample, &reference.transcript).await?;
        let tone_color = match cloning {
            Some(cloning) => Some(cloning.derive_profile(sample, &reference.transcript).await?),
            None => None,
        };

        let profile = Arc::new(VoiceProfile {
            id: VoiceProfile::id_for(fingerprint),
            fingerprint: fingerprint.clone(),
            mode,
            transcript: reference.transcript.trim().to_string(),
            conditioning,
            tone_color,
            sample_duration_secs: sample.duration_secs(),
            source_url: reference.url.clone(),
            created_at: chrono::Utc::now(),
        });
        self.counters.derivations.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "voice_cache",
            fingerprint = %fingerprint,
            mode = mode.as_str(),
            sample_s = profile.sample_duration_secs,
            elapsed_ms = elapsed_ms(start),
            "Derived voice profile"
        );
        self.insert(Arc::clone(&profile));
        Ok(profile)
    }

    fn insert(&self, profile: Arc<VoiceProfile>) {
        let fingerprint = profile.fingerprint.clone();
        let evicted = self.lock().profiles.push(
            fingerprint.clone(),
            Entry {
                profile,
                last_access: Instant::now(),
            },
        );
        if let Some((old, _)) = evicted {
            if old != fingerprint {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(target: "voice_cache", fingerprint = %old, "Evicted least recently used profile");
            }
        }
    }

    fn lookup_alias(&self, key: &RequestKey) -> Option<Arc<VoiceProfile>> {
        let mut state = self.lock();
        let fingerprint = state.aliases.get(key).cloned()?;
        let found = self.touch(&mut state, &fingerprint);
        if found.is_none() {
            state.aliases.pop(key);
        }
        found
    }

    fn lookup_fingerprint(&self, fingerprint: &Fingerprint) -> Option<Arc<VoiceProfile>> {
        let mut state = self.lock();
        self.touch(&mut state, fingerprint)
    }

    /// Promote and refresh an entry, dropping it if it sat idle past the TTL.
    fn touch(&self, state: &mut CacheState, fingerprint: &Fingerprint) -> Option<Arc<VoiceProfile>> {
        let entry = state.profiles.get_mut(fingerprint)?;
        if let Some(ttl) = self.ttl {
            if entry.last_access.elapsed() > ttl {
                state.profiles.pop(fingerprint);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(target: "voice_cache", fingerprint = %fingerprint, "Profile expired");
                return None;
            }
        }
        entry.last_access = Instant::now();
        Some(Arc::clone(&entry.profile))
    }

    /// Peek at a cached profile without refreshing it.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<VoiceProfile>> {
        let state = self.lock();
        let entry = state.profiles.peek(fingerprint)?;
        match self.ttl {
            Some(ttl) if entry.last_access.elapsed() > ttl => None,
            _ => Some(Arc::clone(&entry.profile)),
        }
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = self.lock().profiles.pop(fingerprint).is_some();
        if removed {
            info!(target: "voice_cache", fingerprint = %fingerprint, "Invalidated voice profile");
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.profiles.clear();
        state.aliases.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            derivations: self.counters.derivations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
