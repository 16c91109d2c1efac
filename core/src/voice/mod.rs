//! Voice cloning state: derived profiles (cache) and named voices (registry).

mod cache;
mod profile;
pub mod registry;

pub use cache::{CacheStats, VoiceCacheConfig, VoiceProfileCache};
pub use profile::{CloneMode, Fingerprint, VoiceProfile, VoiceReference};
pub use registry::{NewVoice, StoredVoice, VoiceRegistry, VoiceUpdate};
