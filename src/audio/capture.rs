//! Microphone capture channel
//!
//! Takes a started microphone stream, normalises it to the capture format,
//! cuts it into fixed-size frames and hands each frame, in order, to a sink
//! supplied by the session controller. The channel performs no network I/O
//! itself.

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{AudioBackend, AudioFrame, MicrophoneStream};

/// Frame format delivered to the sink
#[derive(Debug, Clone, Copy)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per frame (all channels)
    pub frame_samples: usize,
}

/// Re-chunks arbitrarily sized sample runs into fixed-size frames
#[derive(Debug)]
pub struct Framer {
    frame_samples: usize,
    pending: Vec<i16>,
}

impl Framer {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples and return every frame that is now complete
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_samples;
        let mut frames = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(self.frame_samples) {
            frames.push(chunk.to_vec());
        }
        self.pending.drain(..complete * self.frame_samples);
        frames
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// An attached capture channel; frames flow to the sink until `detach`
pub struct AudioCaptureChannel {
    backend: Option<Box<dyn AudioBackend>>,
    task: Option<JoinHandle<()>>,
}

impl AudioCaptureChannel {
    /// Start forwarding frames from `stream` to `sink`
    pub fn attach<F>(stream: MicrophoneStream, format: CaptureFormat, mut sink: F) -> Self
    where
        F: FnMut(Vec<i16>) + Send + 'static,
    {
        let MicrophoneStream { backend, mut frames } = stream;
        info!(
            "Capture channel attached to {} ({}Hz, {} samples/frame)",
            backend.name(),
            format.sample_rate,
            format.frame_samples
        );

        let task = tokio::spawn(async move {
            let mut framer = Framer::new(format.frame_samples);
            let mut sent = 0u64;

            while let Some(frame) = frames.recv().await {
                let frame = normalize_frame(frame, format.sample_rate, format.channels);
                for samples in framer.push(&frame.samples) {
                    sink(samples);
                    sent += 1;
                }
            }

            debug!("Capture stream ended after {} frames", sent);
        });

        Self {
            backend: Some(backend),
            task: Some(task),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.task.is_some()
    }

    /// Stop frame delivery and release the microphone
    ///
    /// The forwarding task is cancelled before the hardware is released,
    /// and the hardware is released even if the task already ended.
    pub async fn detach(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        if let Some(mut backend) = self.backend.take() {
            backend.stop().await?;
            info!("Capture channel detached, {} released", backend.name());
        }

        Ok(())
    }
}

impl Drop for AudioCaptureChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.backend.is_some() {
            warn!("Capture channel dropped without detach; microphone may stay open");
        }
    }
}

/// Bring a frame to the capture sample rate and channel count
pub fn normalize_frame(frame: AudioFrame, target_sample_rate: u32, target_channels: u16) -> AudioFrame {
    let mut processed = frame;

    // Convert to mono first so resampling never splits an interleaved pair
    if processed.channels != target_channels && target_channels == 1 {
        processed = stereo_to_mono(processed);
    }

    if processed.sample_rate != target_sample_rate {
        processed = resample_frame(processed, target_sample_rate);
    }

    processed
}

/// Resample by linear interpolation between neighbouring sample frames
///
/// Works for any pair of rates, so 44.1kHz and 24kHz sources come out at
/// the target rate rather than at some integer fraction of it.
fn resample_frame(frame: AudioFrame, target_rate: u32) -> AudioFrame {
    if frame.sample_rate == target_rate || target_rate == 0 || frame.sample_rate == 0 {
        return frame;
    }

    let channels = frame.channels.max(1) as usize;
    let in_frames = frame.samples.len() / channels;
    let out_frames = (in_frames as u64 * target_rate as u64 / frame.sample_rate as u64) as usize;
    let step = frame.sample_rate as f64 / target_rate as f64;

    let mut resampled = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let position = i as f64 * step;
        let index = (position as usize).min(in_frames - 1);
        let next = (index + 1).min(in_frames - 1);
        let fraction = position - index as f64;

        for ch in 0..channels {
            let a = frame.samples[index * channels + ch] as f64;
            let b = frame.samples[next * channels + ch] as f64;
            resampled.push((a + (b - a) * fraction).round() as i16);
        }
    }

    AudioFrame {
        samples: resampled,
        sample_rate: target_rate,
        channels: frame.channels,
        timestamp_ms: frame.timestamp_ms,
    }
}

/// Convert stereo to mono by averaging channels
fn stereo_to_mono(frame: AudioFrame) -> AudioFrame {
    if frame.channels != 2 {
        return frame; // Only support stereo -> mono
    }

    let mono_samples = frame
        .samples
        .chunks_exact(2)
        .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
        .collect();

    AudioFrame {
        samples: mono_samples,
        sample_rate: frame.sample_rate,
        channels: 1,
        timestamp_ms: frame.timestamp_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_framer_holds_partial_frames() {
        let mut framer = Framer::new(1600);
        assert!(framer.push(&[1; 1000]).is_empty());

        let frames = framer.push(&[2; 1000]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 1600);
        assert_eq!(frames[0][999], 1);
        assert_eq!(frames[0][1000], 2);
        assert_eq!(framer.pending_len(), 400);
    }

    #[test]
    fn test_framer_emits_several_frames_from_one_push() {
        let mut framer = Framer::new(4);
        let frames = framer.push(&[0, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frames, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
        assert_eq!(framer.pending_len(), 1);
    }

    #[test]
    fn test_normalize_48k_stereo_to_16k_mono() {
        let frame = AudioFrame {
            samples: (0..9600).map(|i| if i % 2 == 0 { 100 } else { 300 }).collect(),
            sample_rate: 48000,
            channels: 2,
            timestamp_ms: 0,
        };
        let out = normalize_frame(frame, 16000, 1);
        assert_eq!(out.channels, 1);
        assert_eq!(out.sample_rate, 16000);
        assert_eq!(out.samples.len(), 1600);
    }

    #[test]
    fn test_resample_fractional_ratios_to_16k() {
        for rate in [24000u32, 44100] {
            let frame = AudioFrame {
                samples: vec![1000; rate as usize],
                sample_rate: rate,
                channels: 1,
                timestamp_ms: 0,
            };
            let out = normalize_frame(frame, 16000, 1);
            assert_eq!(out.sample_rate, 16000, "{}Hz source", rate);
            assert_eq!(out.samples.len(), 16000, "{}Hz source", rate);
            assert!(out.samples.iter().all(|&s| s == 1000));
        }
    }

    #[test]
    fn test_resample_interpolates_between_samples() {
        // 24kHz ramp: each output sample sits 1.5 input samples after the last
        let frame = AudioFrame {
            samples: vec![0, 100, 200, 300, 400, 500],
            sample_rate: 24000,
            channels: 1,
            timestamp_ms: 0,
        };
        let out = normalize_frame(frame, 16000, 1);
        assert_eq!(out.samples, vec![0, 150, 300, 450]);
    }

    struct FlagBackend {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl AudioBackend for FlagBackend {
        async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
            unreachable!("stream is built by the test")
        }

        async fn stop(&mut self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_capturing(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }

        fn name(&self) -> &str {
            "flag"
        }
    }

    #[tokio::test]
    async fn test_frames_reach_sink_in_order_and_detach_stops_tracks() -> Result<()> {
        let stopped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(8);
        let stream = MicrophoneStream {
            backend: Box::new(FlagBackend {
                stopped: Arc::clone(&stopped),
            }),
            frames: rx,
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut channel = AudioCaptureChannel::attach(
            stream,
            CaptureFormat {
                sample_rate: 16000,
                channels: 1,
                frame_samples: 2,
            },
            move |samples| {
                let _ = out_tx.send(samples);
            },
        );

        tx.send(AudioFrame {
            samples: vec![1, 2, 3],
            sample_rate: 16000,
            channels: 1,
            timestamp_ms: 0,
        })
        .await?;
        tx.send(AudioFrame {
            samples: vec![4],
            sample_rate: 16000,
            channels: 1,
            timestamp_ms: 1,
        })
        .await?;

        assert_eq!(out_rx.recv().await, Some(vec![1, 2]));
        assert_eq!(out_rx.recv().await, Some(vec![3, 4]));

        channel.detach().await?;
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!channel.is_attached());

        // Second detach is a no-op
        channel.detach().await?;
        Ok(())
    }
}
