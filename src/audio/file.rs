use anyhow::{bail, Context, Result};
use hound::WavReader;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::backend::{AudioBackend, AudioBackendConfig, AudioFrame};
use super::capture::normalize_frame;

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path)
            .context("Failed to open WAV file")?;

        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            bail!(
                "Expected 16-bit integer PCM, got {}-bit {:?}",
                spec.bits_per_sample,
                spec.sample_format
            );
        }

        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds = samples.len() as f64 /
            (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Whole file converted to the capture format (resampled, mono)
    pub fn to_frame(&self, config: &AudioBackendConfig) -> AudioFrame {
        normalize_frame(
            AudioFrame {
                samples: self.samples.clone(),
                sample_rate: self.sample_rate,
                channels: self.channels,
                timestamp_ms: 0,
            },
            config.target_sample_rate,
            config.target_channels,
        )
    }
}

/// Paces `samples` into the channel in real time, then streams silence
fn spawn_paced_stream(
    name: &'static str,
    samples: Vec<i16>,
    config: AudioBackendConfig,
    tx: mpsc::Sender<AudioFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let chunk = (config.target_sample_rate as u64 * config.buffer_duration_ms / 1000) as usize
            * config.target_channels as usize;
        let chunk = chunk.max(1);
        let mut ticker = tokio::time::interval(Duration::from_millis(config.buffer_duration_ms.max(1)));
        let mut offset = 0usize;
        let mut timestamp_ms = 0u64;

        loop {
            ticker.tick().await;

            let samples = if offset < samples.len() {
                let end = (offset + chunk).min(samples.len());
                let mut out = samples[offset..end].to_vec();
                out.resize(chunk, 0);
                offset = end;
                if offset == samples.len() {
                    debug!("{}: source exhausted, streaming silence", name);
                }
                out
            } else {
                vec![0i16; chunk]
            };

            let frame = AudioFrame {
                samples,
                sample_rate: config.target_sample_rate,
                channels: config.target_channels,
                timestamp_ms,
            };
            timestamp_ms += config.buffer_duration_ms;

            if tx.send(frame).await.is_err() {
                break;
            }
        }
    })
}

/// Capture backend that plays a WAV file as if it were spoken into a microphone
pub struct FileBackend {
    config: AudioBackendConfig,
    samples: Vec<i16>,
    task: Option<JoinHandle<()>>,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>, config: AudioBackendConfig) -> Result<Self> {
        let file = AudioFile::open(path)?;
        let samples = file.to_frame(&config).samples;

        info!(
            "File backend ready ({}Hz, {} channels, {} samples)",
            config.target_sample_rate,
            config.target_channels,
            samples.len()
        );

        Ok(Self {
            config,
            samples,
            task: None,
        })
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.task.is_some() {
            bail!("Already capturing");
        }

        let (tx, rx) = mpsc::channel(100);
        self.task = Some(spawn_paced_stream(
            "file backend",
            self.samples.clone(),
            self.config.clone(),
            tx,
        ));

        info!("File capture started");
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("File capture stopped");
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "WAV file"
    }
}

/// Capture backend that produces only silence
pub struct SilenceBackend {
    config: AudioBackendConfig,
    task: Option<JoinHandle<()>>,
}

impl SilenceBackend {
    pub fn new(config: AudioBackendConfig) -> Self {
        Self { config, task: None }
    }
}

#[async_trait::async_trait]
impl AudioBackend for SilenceBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        if self.task.is_some() {
            bail!("Already capturing");
        }

        let (tx, rx) = mpsc::channel(100);
        self.task = Some(spawn_paced_stream("silence backend", Vec::new(), self.config.clone(), tx));
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }

    fn name(&self) -> &str {
        "silence"
    }
}
