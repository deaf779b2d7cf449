//! Rendered audio output
//!
//! RenderOutput is an output context whose clock is the tokio clock. Scheduled
//! sources are mixed into an in-memory timeline at their start time, completion
//! is signalled when the clock passes their end, and stopping a source removes
//! whatever part of it has not been "played" yet. On close the timeline can be
//! written to a WAV file, which is how the CLI lets you listen to a session.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::codec::PlayableBuffer;
use super::playback::{OutputContext, OutputDevice, SourceId};

/// Opens [`RenderOutput`] contexts, optionally saving each session's audio
#[derive(Debug, Clone, Default)]
pub struct RenderDevice {
    output_path: Option<PathBuf>,
}

impl RenderDevice {
    pub fn new(output_path: Option<PathBuf>) -> Self {
        Self { output_path }
    }
}

impl OutputDevice for RenderDevice {
    fn open(
        &self,
        sample_rate: u32,
        channels: u16,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputContext>> {
        Ok(Box::new(RenderOutput::new(
            sample_rate,
            channels,
            ended,
            self.output_path.clone(),
        )))
    }
}

struct RenderedSource {
    /// Index into the interleaved timeline
    start_index: usize,
    samples: Vec<f32>,
    timer: JoinHandle<()>,
}

impl RenderedSource {
    fn end_index(&self) -> usize {
        self.start_index + self.samples.len()
    }
}

pub struct RenderOutput {
    sample_rate: u32,
    channels: u16,
    origin: Instant,
    timeline: Vec<f32>,
    sources: HashMap<SourceId, RenderedSource>,
    ended: mpsc::UnboundedSender<SourceId>,
    output_path: Option<PathBuf>,
    closed: bool,
}

impl RenderOutput {
    pub fn new(
        sample_rate: u32,
        channels: u16,
        ended: mpsc::UnboundedSender<SourceId>,
        output_path: Option<PathBuf>,
    ) -> Self {
        info!("Render output opened ({}Hz, {} channels)", sample_rate, channels);

        Self {
            sample_rate,
            channels: channels.max(1),
            origin: Instant::now(),
            timeline: Vec::new(),
            sources: HashMap::new(),
            ended,
            output_path,
            closed: false,
        }
    }

    fn index_at(&self, seconds: f64) -> usize {
        (seconds.max(0.0) * self.sample_rate as f64) as usize * self.channels as usize
    }

    fn prune_finished(&mut self) {
        let now_index = self.index_at(self.current_time());
        self.sources.retain(|_, source| source.end_index() > now_index);
    }

    /// Mixed audio rendered so far (interleaved)
    pub fn timeline(&self) -> &[f32] {
        &self.timeline
    }

    fn write_wav(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create output directory")?;
            }
        }

        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", path))?;
        for &sample in &self.timeline {
            let pcm = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer.write_sample(pcm).context("Failed to write sample to WAV")?;
        }
        writer.finalize().context("Failed to finalize WAV file")?;

        info!(
            "Rendered {:.1}s of assistant audio to {}",
            self.timeline.len() as f64 / (self.sample_rate as f64 * self.channels as f64),
            path.display()
        );
        Ok(())
    }
}

impl OutputContext for RenderOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start_source(&mut self, id: SourceId, buffer: PlayableBuffer, when: f64) -> Result<()> {
        self.prune_finished();

        let start_index = self.index_at(when);
        let end_index = start_index + buffer.samples.len();
        if self.timeline.len() < end_index {
            self.timeline.resize(end_index, 0.0);
        }
        for (slot, sample) in self.timeline[start_index..end_index].iter_mut().zip(&buffer.samples) {
            *slot += sample;
        }

        let ends_at = self.origin + Duration::from_secs_f64(when.max(0.0) + buffer.duration());
        let ended = self.ended.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(ends_at).await;
            let _ = ended.send(id);
        });

        self.sources.insert(
            id,
            RenderedSource {
                start_index,
                samples: buffer.samples,
                timer,
            },
        );
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        let Some(source) = self.sources.remove(&id) else {
            return;
        };
        source.timer.abort();

        // Remove the unplayed remainder from the mix
        let cut_from = self.index_at(self.current_time()).max(source.start_index);
        let cut_to = source.end_index().min(self.timeline.len());
        for index in cut_from..cut_to {
            self.timeline[index] -= source.samples[index - source.start_index];
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for (_, source) in self.sources.drain() {
            source.timer.abort();
        }

        // Nothing past the close instant was heard
        let heard = self.index_at(self.current_time()).min(self.timeline.len());
        self.timeline.truncate(heard);

        if let Some(path) = self.output_path.clone() {
            self.write_wav(&path)?;
        }

        info!("Render output closed");
        Ok(())
    }
}

impl Drop for RenderOutput {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Render output dropped without close");
            for (_, source) in self.sources.drain() {
                source.timer.abort();
            }
        }
    }
}
