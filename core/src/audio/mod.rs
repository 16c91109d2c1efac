//! Audio buffers, WAV codec and output encoding.

mod buffer;
mod encode;
pub mod wav;

pub use buffer::AudioBuffer;
pub use encode::{AudioEncoder, EncodedAudio, OutputFormat};
