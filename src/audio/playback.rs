//! Gapless playback of streamed synthesized audio
//!
//! Fragments are scheduled back to back on the output clock through a single
//! cursor, `next_start_time`. Each fragment starts at
//! `max(next_start_time, now)` and moves the cursor forward by its duration,
//! so fragments never overlap and only leave a gap when they arrive slower
//! than real time.

use anyhow::Result;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::codec::{decode_to_playable, PlayableBuffer};

/// Identifier of one scheduled audio source
pub type SourceId = u64;

/// An audio output with its own clock
///
/// Implementations report natural completion of a source through the
/// `ended` channel handed to [`OutputDevice::open`].
pub trait OutputContext: Send {
    /// Output clock in seconds
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to start playing at clock time `when`
    fn start_source(&mut self, id: SourceId, buffer: PlayableBuffer, when: f64) -> Result<()>;

    /// Stop a source immediately, whether playing or still queued
    fn stop_source(&mut self, id: SourceId);

    /// Release the output device
    fn close(&mut self) -> Result<()>;
}

/// Opens output contexts, the controller's seam to playback hardware
pub trait OutputDevice: Send + Sync {
    fn open(
        &self,
        sample_rate: u32,
        channels: u16,
        ended: mpsc::UnboundedSender<SourceId>,
    ) -> Result<Box<dyn OutputContext>>;
}

/// Where and for how long a fragment was scheduled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledFragment {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

pub struct AudioPlaybackScheduler {
    output: Box<dyn OutputContext>,
    sample_rate: u32,
    channels: u16,
    next_start_time: f64,
    active: HashSet<SourceId>,
    next_id: SourceId,
}

impl AudioPlaybackScheduler {
    pub fn new(output: Box<dyn OutputContext>, sample_rate: u32, channels: u16) -> Self {
        Self {
            output,
            sample_rate,
            channels,
            next_start_time: 0.0,
            active: HashSet::new(),
            next_id: 0,
        }
    }

    /// Decode raw PCM bytes and queue them right after the previous fragment
    pub fn on_audio_fragment(&mut self, bytes: &[u8]) -> Result<ScheduledFragment> {
        let buffer = decode_to_playable(bytes, self.sample_rate, self.channels)?;
        let duration = buffer.duration();

        let start = self.next_start_time.max(self.output.current_time());
        let id = self.next_id;
        self.next_id += 1;

        self.output.start_source(id, buffer, start)?;
        self.next_start_time = start + duration;
        self.active.insert(id);

        debug!(
            "Scheduled source {} at {:.3}s ({:.3}s, {} active)",
            id,
            start,
            duration,
            self.active.len()
        );

        Ok(ScheduledFragment { id, start, duration })
    }

    /// A source finished playing on its own
    pub fn on_source_ended(&mut self, id: SourceId) {
        self.active.remove(&id);
    }

    /// Barge-in: discard everything playing or queued and reset the cursor
    pub fn on_interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.drain() {
            self.output.stop_source(id);
        }
        self.next_start_time = 0.0;

        if stopped > 0 {
            info!("Playback interrupted, {} sources stopped", stopped);
        }
        stopped
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_sources(&self) -> usize {
        self.active.len()
    }

    /// Stop all sources and release the output
    pub fn close(&mut self) -> Result<()> {
        self.on_interrupt();
        self.output.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        now: f64,
        starts: Vec<(SourceId, f64, f64)>,
        stops: Vec<SourceId>,
        closed: bool,
    }

    struct FakeOutput(Arc<Mutex<Recorded>>);

    impl OutputContext for FakeOutput {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().now
        }

        fn start_source(&mut self, id: SourceId, buffer: PlayableBuffer, when: f64) -> Result<()> {
            self.0.lock().unwrap().starts.push((id, when, buffer.duration()));
            Ok(())
        }

        fn stop_source(&mut self, id: SourceId) {
            self.0.lock().unwrap().stops.push(id);
        }

        fn close(&mut self) -> Result<()> {
            self.0.lock().unwrap().closed = true;
            Ok(())
        }
    }

    // 24kHz mono, 2 bytes per sample
    fn pcm(seconds: f64) -> Vec<u8> {
        vec![0u8; (seconds * 24000.0) as usize * 2]
    }

    fn scheduler(now: f64) -> (AudioPlaybackScheduler, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded {
            now,
            ..Recorded::default()
        }));
        let output = Box::new(FakeOutput(Arc::clone(&recorded)));
        (AudioPlaybackScheduler::new(output, 24000, 1), recorded)
    }

    #[test]
    fn test_back_to_back_fragments_are_gapless() -> Result<()> {
        let (mut sched, recorded) = scheduler(2.0);

        let first = sched.on_audio_fragment(&pcm(1.0))?;
        let second = sched.on_audio_fragment(&pcm(1.5))?;

        assert_eq!(first.start, 2.0);
        assert_eq!(second.start, 3.0);
        assert!((sched.next_start_time() - 4.5).abs() < 1e-9);
        assert_eq!(sched.active_sources(), 2);
        assert_eq!(recorded.lock().unwrap().starts.len(), 2);
        Ok(())
    }

    #[test]
    fn test_late_fragment_starts_at_clock() -> Result<()> {
        let (mut sched, recorded) = scheduler(0.0);
        sched.on_audio_fragment(&pcm(1.0))?;

        recorded.lock().unwrap().now = 5.0;
        let late = sched.on_audio_fragment(&pcm(0.5))?;
        assert_eq!(late.start, 5.0);
        assert!((sched.next_start_time() - 5.5).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_natural_completion_leaves_active_set() -> Result<()> {
        let (mut sched, _) = scheduler(0.0);
        let frag = sched.on_audio_fragment(&pcm(0.2))?;
        sched.on_source_ended(frag.id);
        assert_eq!(sched.active_sources(), 0);
        // Cursor is unaffected by completion
        assert!((sched.next_start_time() - 0.2).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_interrupt_stops_everything_and_resets_cursor() -> Result<()> {
        let (mut sched, recorded) = scheduler(1.0);
        let a = sched.on_audio_fragment(&pcm(1.0))?;
        let b = sched.on_audio_fragment(&pcm(1.0))?;

        assert_eq!(sched.on_interrupt(), 2);
        assert_eq!(sched.active_sources(), 0);
        assert_eq!(sched.next_start_time(), 0.0);

        let mut stops = recorded.lock().unwrap().stops.clone();
        stops.sort();
        assert_eq!(stops, vec![a.id, b.id]);

        // Next fragment schedules against the clock, not the old cursor
        recorded.lock().unwrap().now = 1.25;
        let next = sched.on_audio_fragment(&pcm(0.5))?;
        assert_eq!(next.start, 1.25);
        Ok(())
    }

    #[test]
    fn test_close_releases_output() -> Result<()> {
        let (mut sched, recorded) = scheduler(0.0);
        sched.on_audio_fragment(&pcm(0.1))?;
        sched.close()?;

        let recorded = recorded.lock().unwrap();
        assert!(recorded.closed);
        assert_eq!(recorded.stops.len(), 1);
        Ok(())
    }
}
