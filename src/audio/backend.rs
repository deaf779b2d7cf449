use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::mpsc;

use super::file::{FileBackend, SilenceBackend};

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn duration_ms(&self) -> u64 {
        let per_channel = self.samples.len() as u64 / self.channels.max(1) as u64;
        per_channel * 1000 / self.sample_rate.max(1) as u64
    }
}

/// Configuration for audio backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Target sample rate (will resample if needed)
    pub target_sample_rate: u32,
    /// Target channel count (1 = mono, 2 = stereo)
    pub target_channels: u16,
    /// Buffer size in milliseconds (affects latency)
    pub buffer_duration_ms: u64,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16000, // 16kHz for the live endpoint
            target_channels: 1,        // Mono
            buffer_duration_ms: 100,   // 100ms buffers
        }
    }
}

/// Audio capture backend trait
///
/// A started backend is the equivalent of a live microphone track: it keeps
/// the input device open until `stop` is called.
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>>;

    /// Stop capturing audio and release the device
    async fn stop(&mut self) -> Result<()>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// A started capture backend together with its frame stream
pub struct MicrophoneStream {
    pub backend: Box<dyn AudioBackend>,
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Microphone acquisition, the controller's seam to capture hardware
#[async_trait::async_trait]
pub trait CaptureDevices: Send + Sync {
    /// Acquire the microphone and start its stream
    async fn open_microphone(&self, config: AudioBackendConfig) -> Result<MicrophoneStream>;
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// WAV file played in real time, followed by silence
    File(PathBuf),
    /// Continuous silence
    Silence,
}

/// Audio backend factory
#[derive(Debug, Clone)]
pub struct AudioBackendFactory {
    source: AudioSource,
}

impl AudioBackendFactory {
    pub fn new(source: AudioSource) -> Self {
        Self { source }
    }

    /// Create audio backend based on configured source
    pub fn create(&self, config: AudioBackendConfig) -> Result<Box<dyn AudioBackend>> {
        match &self.source {
            AudioSource::File(path) => Ok(Box::new(FileBackend::open(path, config)?)),
            AudioSource::Silence => Ok(Box::new(SilenceBackend::new(config))),
        }
    }
}

#[async_trait::async_trait]
impl CaptureDevices for AudioBackendFactory {
    async fn open_microphone(&self, config: AudioBackendConfig) -> Result<MicrophoneStream> {
        let mut backend = self.create(config)?;
        let frames = backend.start().await?;
        Ok(MicrophoneStream { backend, frames })
    }
}
