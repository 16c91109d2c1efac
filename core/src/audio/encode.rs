use super::{wav, AudioBuffer};
use crate::error::{Result, SynthesisError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp3,
    Wav,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "audio/mpeg",
            OutputFormat::Wav => "audio/wav",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(OutputFormat::Mp3),
            "wav" => Ok(OutputFormat::Wav),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodedAudio {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub duration_secs: f64,
    pub sample_rate: u32,
}

/// Container encoding. WAV is written in-process; MP3 and foreign input
/// formats go through an external `ffmpeg`.
#[derive(Debug, Clone, Default)]
pub struct AudioEncoder {
    ffmpeg_bin: Option<PathBuf>,
}

impl AudioEncoder {
    pub fn new(ffmpeg_bin: Option<PathBuf>) -> Self {
        Self { ffmpeg_bin }
    }

    pub fn has_ffmpeg(&self) -> bool {
        self.ffmpeg_bin.is_some()
    }

    pub async fn encode(&self, audio: &AudioBuffer, format: OutputFormat) -> Result<EncodedAudio> {
        if audio.is_empty() {
            return Err(SynthesisError::Encoding("no audio samples to encode".into()));
        }
        let wav_bytes = wav::encode_pcm16(audio)?;
        let bytes = match format {
            OutputFormat::Wav => wav_bytes,
            OutputFormat::Mp3 => {
                self.run_ffmpeg(
                    wav_bytes,
                    &["-f", "wav", "-i", "pipe:0", "-codec:a", "libmp3lame", "-qscale:a", "2", "-f", "mp3", "pipe:1"],
                )
                .await?
            }
        };
        Ok(EncodedAudio {
            bytes,
            format,
            duration_secs: audio.duration_secs(),
            sample_rate: audio.sample_rate,
        })
    }

    /// Decode arbitrary container bytes (mp3, ogg, flac…) into WAV bytes.
    pub async fn transcode_to_wav(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        self.run_ffmpeg(input, &["-i", "pipe:0", "-f", "wav", "-acodec", "pcm_s16le", "pipe:1"])
            .await
    }

    async fn run_ffmpeg(&self, input: Vec<u8>, args: &[&str]) -> Result<Vec<u8>> {
        let bin = self.ffmpeg_bin.as_ref().ok_or_else(|| {
            SynthesisError::Encoding("ffmpeg not found; set FFMPEG_BIN or request wav".into())
        })?;

        let mut cmd = Command::new(bin);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"]);
        cmd.args(args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(target: "encoder", command = ?cmd, "Running ffmpeg");
        let mut child = cmd
            .spawn()
            .map_err(|e| SynthesisError::Encoding(format!("failed to spawn ffmpeg: {}", e)))?;

        // Feed stdin concurrently so a full stdout pipe cannot deadlock us
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SynthesisError::Encoding("ffmpeg stdin unavailable".into()))?;
        let writer = tokio::spawn(async move {
            let res = stdin.write_all(&input).await;
            drop(stdin);
            res
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SynthesisError::Encoding(format!("ffmpeg failed: {}", e)))?;
        let _ = writer.await;

        if !output.status.success() {
            return Err(SynthesisError::Encoding(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(SynthesisError::Encoding("ffmpeg produced no output".into()));
        }
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_and_metadata() {
        assert_eq!("MP3".parse::<OutputFormat>(), Ok(OutputFormat::Mp3));
        assert_eq!("wav".parse::<OutputFormat>(), Ok(OutputFormat::Wav));
        assert!("ogg".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Mp3.content_type(), "audio/mpeg");
        assert_eq!(OutputFormat::default(), OutputFormat::Mp3);
    }

    #[tokio::test]
    async fn wav_encoding_needs_no_ffmpeg() {
        let enc = AudioEncoder::new(None);
        let audio = AudioBuffer::new(vec![0.1; 16_000], 16_000);
        let out = enc.encode(&audio, OutputFormat::Wav).await.unwrap();
        assert!(wav::is_wav(&out.bytes));
        assert!((out.duration_secs - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn mp3_without_ffmpeg_is_an_encoding_error() {
        let enc = AudioEncoder::new(None);
        let audio = AudioBuffer::new(vec![0.1; 160], 16_000);
        let err = enc.encode(&audio, OutputFormat::Mp3).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Encoding);
    }
}
