//! Gapless playback scheduling
//!
//! Speech arrives in bursts and with network jitter. Each decoded chunk is
//! placed on a virtual timeline right after the previous one (or at the
//! device's current time if the timeline has fallen behind), so consecutive
//! chunks play back to back regardless of when they arrived. An interruption
//! stops everything still queued and pulls the timeline back to "now".
//!
//! The scheduler is confined to the session's event loop; it is the only
//! writer of its clock and active set.

use crate::codec::{self, EncodedChunk, OUTPUT_SAMPLE_RATE};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub type SourceId = u64;

/// Output clock and the operations the scheduler needs from it.
pub trait Timeline: Send {
    /// Current device time, in seconds.
    fn now(&self) -> f64;
    /// Begin playing `samples` at device time `at`, or right away if the
    /// device is already past `at`. Returns the time playback starts.
    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64) -> f64;
    /// Silence a source immediately, whether or not it has started.
    fn stop(&mut self, id: SourceId);
}

/// A buffer handed to the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSource {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

impl PlaybackSource {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// What happened to an inbound chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Scheduled(PlaybackSource),
    /// Payload could not be decoded or had the wrong format.
    Dropped(String),
    /// Scheduler is disarmed (session tearing down).
    Discarded,
}

pub struct PlaybackScheduler<T: Timeline> {
    timeline: T,
    sample_rate: u32,
    next_start: f64,
    active: HashMap<SourceId, PlaybackSource>,
    next_id: SourceId,
    armed: bool,
}

impl<T: Timeline> PlaybackScheduler<T> {
    pub fn new(timeline: T) -> Self {
        Self::with_sample_rate(timeline, OUTPUT_SAMPLE_RATE)
    }

    pub fn with_sample_rate(timeline: T, sample_rate: u32) -> Self {
        let next_start = timeline.now();
        Self {
            timeline,
            sample_rate,
            next_start,
            active: HashMap::new(),
            next_id: 0,
            armed: true,
        }
    }

    pub fn on_audio_chunk(&mut self, chunk: &EncodedChunk) -> ChunkOutcome {
        if !self.armed {
            debug!("Discarding audio chunk received during teardown");
            return ChunkOutcome::Discarded;
        }

        if let Some(rate) = codec::mime_rate(&chunk.mime_type) {
            if rate != self.sample_rate {
                let reason = format!("unsupported rate {} Hz", rate);
                warn!("Dropping audio chunk: {}", reason);
                return ChunkOutcome::Dropped(reason);
            }
        }

        let samples = match codec::decode_chunk(chunk) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => return ChunkOutcome::Dropped("empty payload".to_string()),
            Err(e) => {
                warn!("Dropping malformed audio chunk: {}", e);
                return ChunkOutcome::Dropped(e.to_string());
            }
        };

        let duration = samples.len() as f64 / self.sample_rate as f64;
        let id = self.next_id;
        self.next_id += 1;

        let at = self.next_start.max(self.timeline.now());
        let start = self.timeline.start(id, Arc::from(samples), at);
        let source = PlaybackSource {
            id,
            start,
            duration,
        };
        self.active.insert(source.id, source);
        self.next_start = source.end();

        debug!(
            "Scheduled source {} at {:.3}s for {:.3}s ({} pending)",
            source.id,
            start,
            duration,
            self.active.len()
        );
        ChunkOutcome::Scheduled(source)
    }

    /// Stop all pending speech and reset the timeline to the device clock.
    /// Returns how many sources were stopped.
    pub fn on_interrupted(&mut self) -> usize {
        let stopped = self.stop_all();
        self.next_start = self.timeline.now();
        debug!(
            "Interrupted: stopped {} sources, timeline reset to {:.3}s",
            stopped, self.next_start
        );
        stopped
    }

    /// Completion callback from the output engine.
    pub fn on_source_finished(&mut self, id: SourceId) {
        self.active.remove(&id);
    }

    /// Stop everything and refuse further chunks.
    pub fn disarm(&mut self) {
        self.armed = false;
        let stopped = self.stop_all();
        if stopped > 0 {
            debug!("Playback disarmed, {} sources stopped", stopped);
        }
    }

    pub fn pending(&self) -> usize {
        self.active.len()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn stop_all(&mut self) -> usize {
        let count = self.active.len();
        for (id, _) in self.active.drain() {
            self.timeline.stop(id);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, pcm_mime, AudioFrame};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;

    /// Manually driven clock that records what the scheduler asked for.
    #[derive(Clone, Default)]
    struct FakeTimeline {
        inner: Arc<Mutex<FakeState>>,
    }

    #[derive(Default)]
    struct FakeState {
        now: f64,
        started: Vec<(SourceId, f64, usize)>,
        stopped: Vec<SourceId>,
    }

    impl FakeTimeline {
        fn at(now: f64) -> Self {
            let timeline = Self::default();
            timeline.advance(now);
            timeline
        }

        fn advance(&self, dt: f64) {
            self.inner.lock().unwrap().now += dt;
        }

        fn started(&self) -> Vec<(SourceId, f64, usize)> {
            self.inner.lock().unwrap().started.clone()
        }

        fn stopped(&self) -> Vec<SourceId> {
            self.inner.lock().unwrap().stopped.clone()
        }
    }

    impl Timeline for FakeTimeline {
        fn now(&self) -> f64 {
            self.inner.lock().unwrap().now
        }

        fn start(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64) -> f64 {
            let mut inner = self.inner.lock().unwrap();
            let start = at.max(inner.now);
            inner.started.push((id, start, samples.len()));
            start
        }

        fn stop(&mut self, id: SourceId) {
            self.inner.lock().unwrap().stopped.push(id);
        }
    }

    fn speech(samples: usize) -> EncodedChunk {
        encode_frame(&AudioFrame::new(vec![0.25; samples], OUTPUT_SAMPLE_RATE))
    }

    #[test]
    fn jittered_chunks_play_back_to_back() {
        let timeline = FakeTimeline::at(1.0);
        let mut scheduler = PlaybackScheduler::new(timeline.clone());
        let mut rng = StdRng::seed_from_u64(7);

        // Arrivals stay ahead of the playhead on average, with bursts and gaps.
        let mut sources = Vec::new();
        for _ in 0..200 {
            let len = rng.random_range(240..4800);
            if let ChunkOutcome::Scheduled(source) = scheduler.on_audio_chunk(&speech(len)) {
                sources.push(source);
            } else {
                panic!("chunk was not scheduled");
            }
            let duration = len as f64 / OUTPUT_SAMPLE_RATE as f64;
            timeline.advance(duration * rng.random_range(0.0..0.95));
        }

        assert_eq!(sources[0].start, 1.0);
        for pair in sources.windows(2) {
            let expected = pair[0].start + pair[0].duration;
            assert!(
                (pair[1].start - expected).abs() < 1e-9,
                "gap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(scheduler.pending(), 200);
        assert_eq!(timeline.started().len(), 200);
    }

    #[test]
    fn late_chunk_starts_at_device_time() {
        let timeline = FakeTimeline::at(0.0);
        let mut scheduler = PlaybackScheduler::new(timeline.clone());

        let first = match scheduler.on_audio_chunk(&speech(2400)) {
            ChunkOutcome::Scheduled(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        assert!((first.duration - 0.1).abs() < 1e-9);

        // The first chunk has long finished by the time the next one shows up.
        timeline.advance(0.5);
        scheduler.on_source_finished(first.id);
        let second = match scheduler.on_audio_chunk(&speech(2400)) {
            ChunkOutcome::Scheduled(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(second.start, 0.5);
        assert_eq!(scheduler.pending(), 1);
    }

    /// Clock that moves one 20 ms block between reading it and scheduling.
    struct RacingTimeline {
        now: f64,
    }

    impl Timeline for RacingTimeline {
        fn now(&self) -> f64 {
            self.now
        }

        fn start(&mut self, _id: SourceId, _samples: Arc<[f32]>, at: f64) -> f64 {
            self.now += 0.02;
            at.max(self.now)
        }

        fn stop(&mut self, _id: SourceId) {}
    }

    #[test]
    fn clock_advances_from_the_actual_start() {
        let mut scheduler = PlaybackScheduler::new(RacingTimeline { now: 0.0 });

        let first = match scheduler.on_audio_chunk(&speech(2400)) {
            ChunkOutcome::Scheduled(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        assert!((first.start - 0.02).abs() < 1e-12);
        assert!((scheduler.next_start() - 0.12).abs() < 1e-12);

        // Still ahead of the clock, so the next chunk follows without a gap.
        let second = match scheduler.on_audio_chunk(&speech(2400)) {
            ChunkOutcome::Scheduled(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        assert!((second.start - first.end()).abs() < 1e-12);
    }

    #[test]
    fn interruption_clears_any_number_of_sources() {
        for pending in [0usize, 1, 17] {
            let timeline = FakeTimeline::at(2.0);
            let mut scheduler = PlaybackScheduler::new(timeline.clone());
            for _ in 0..pending {
                scheduler.on_audio_chunk(&speech(1200));
            }
            timeline.advance(0.01);

            assert_eq!(scheduler.on_interrupted(), pending);
            assert_eq!(scheduler.pending(), 0);
            assert_eq!(timeline.stopped().len(), pending);
            assert!((scheduler.next_start() - 2.01).abs() < 1e-12);

            // Speech after the barge-in starts immediately.
            match scheduler.on_audio_chunk(&speech(1200)) {
                ChunkOutcome::Scheduled(s) => assert!((s.start - 2.01).abs() < 1e-12),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn malformed_chunks_are_dropped_without_moving_the_clock() {
        let timeline = FakeTimeline::at(0.0);
        let mut scheduler = PlaybackScheduler::new(timeline.clone());
        scheduler.on_audio_chunk(&speech(2400));
        let before = scheduler.next_start();

        let garbage = EncodedChunk {
            data: "%%%".to_string(),
            mime_type: pcm_mime(OUTPUT_SAMPLE_RATE),
        };
        assert!(matches!(scheduler.on_audio_chunk(&garbage), ChunkOutcome::Dropped(_)));

        let odd = EncodedChunk {
            data: "AAEC".to_string(),
            mime_type: pcm_mime(OUTPUT_SAMPLE_RATE),
        };
        assert!(matches!(scheduler.on_audio_chunk(&odd), ChunkOutcome::Dropped(_)));

        let wrong_rate = encode_frame(&AudioFrame::new(vec![0.1; 160], 16_000));
        assert!(matches!(scheduler.on_audio_chunk(&wrong_rate), ChunkOutcome::Dropped(_)));

        assert_eq!(scheduler.next_start(), before);
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn disarmed_scheduler_discards_late_chunks() {
        let timeline = FakeTimeline::at(0.0);
        let mut scheduler = PlaybackScheduler::new(timeline.clone());
        scheduler.on_audio_chunk(&speech(2400));
        scheduler.on_audio_chunk(&speech(2400));

        scheduler.disarm();
        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.pending(), 0);
        let mut stopped = timeline.stopped();
        stopped.sort_unstable();
        assert_eq!(stopped, vec![0, 1]);
        assert_eq!(scheduler.on_audio_chunk(&speech(2400)), ChunkOutcome::Discarded);
        assert_eq!(timeline.started().len(), 2);
    }
}
