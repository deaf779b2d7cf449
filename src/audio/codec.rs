use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Encoded audio payload as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioBlob {
    /// Base64-encoded little-endian 16-bit PCM
    pub data: String,
    pub mime_type: String,
}

/// Encode captured samples for transmission
pub fn encode_frame(samples: &[i16], sample_rate: u32) -> AudioBlob {
    let pcm_bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

    AudioBlob {
        data: base64::engine::general_purpose::STANDARD.encode(pcm_bytes),
        mime_type: format!("audio/pcm;rate={}", sample_rate),
    }
}

/// Decode a base64 payload into raw bytes
pub fn decode_blob(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .context("Invalid base64 audio payload")
}

/// Decoded audio ready to be scheduled on an output context
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    /// Interleaved samples in [-1.0, 1.0)
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlayableBuffer {
    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback length in seconds
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Interpret raw little-endian 16-bit PCM as a playable buffer
pub fn decode_to_playable(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PlayableBuffer> {
    if sample_rate == 0 || channels == 0 {
        bail!("Invalid output format: {}Hz, {} channels", sample_rate, channels);
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(PlayableBuffer {
        samples,
        sample_rate,
        channels,
    })
}
