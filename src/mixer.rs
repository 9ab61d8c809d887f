//! Output engine
//!
//! A render thread mixes every scheduled source into fixed 20 ms blocks and
//! writes them to the output device. The number of samples rendered so far is
//! the device clock the playback scheduler schedules against.

use crate::device::{DeviceError, OutputDevice};
use crate::playback::{SourceId, Timeline};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

const BLOCK_MS: u32 = 20;

struct Voice {
    id: SourceId,
    /// First sample position on the device clock.
    start: u64,
    samples: Arc<[f32]>,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Sources waiting to play and the render position.
#[derive(Default)]
pub struct MixState {
    position: u64,
    voices: Vec<Voice>,
}

impl MixState {
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Schedule a source. A start the renderer has already passed is moved
    /// to the current position so the source plays in full. Returns the
    /// position it will start at.
    pub fn add(&mut self, id: SourceId, start: u64, samples: Arc<[f32]>) -> u64 {
        let start = start.max(self.position);
        self.voices.push(Voice { id, start, samples });
        start
    }

    /// Remove a source. Returns false if it was not (or no longer) scheduled.
    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub fn voices(&self) -> usize {
        self.voices.len()
    }

    /// Render the next `out.len()` samples and advance the clock. Returns the
    /// sources that finished within this block.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<SourceId> {
        out.fill(0.0);
        let block_start = self.position;
        let block_end = block_start + out.len() as u64;

        for voice in &self.voices {
            if voice.start >= block_end || voice.end() <= block_start {
                continue;
            }
            let from = voice.start.max(block_start);
            let to = voice.end().min(block_end);
            for pos in from..to {
                out[(pos - block_start) as usize] += voice.samples[(pos - voice.start) as usize];
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position = block_end;
        let mut finished = Vec::new();
        self.voices.retain(|v| {
            if v.end() <= block_end {
                finished.push(v.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

fn lock(state: &Mutex<MixState>) -> MutexGuard<'_, MixState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// [`Timeline`] backed by the render thread's clock.
#[derive(Clone)]
pub struct MixerTimeline {
    state: Arc<Mutex<MixState>>,
    sample_rate: u32,
}

impl Timeline for MixerTimeline {
    fn now(&self) -> f64 {
        lock(&self.state).position() as f64 / self.sample_rate as f64
    }

    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64) -> f64 {
        let requested = (at * self.sample_rate as f64).round().max(0.0) as u64;
        let start = lock(&self.state).add(id, requested, samples);
        start as f64 / self.sample_rate as f64
    }

    fn stop(&mut self, id: SourceId) {
        lock(&self.state).remove(id);
    }
}

/// Owns the render thread and, through it, the output device.
pub struct OutputEngine {
    state: Arc<Mutex<MixState>>,
    sample_rate: u32,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OutputEngine {
    /// Start rendering to `device`. Finished source ids are reported on
    /// `finished`, a device write error on `faults`.
    pub fn spawn(
        device: Box<dyn OutputDevice>,
        sample_rate: u32,
        finished: UnboundedSender<SourceId>,
        faults: UnboundedSender<DeviceError>,
    ) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(MixState::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = std::thread::Builder::new()
            .name("playback".to_string())
            .spawn({
                let state = state.clone();
                let shutdown = shutdown.clone();
                move || render_loop(device, sample_rate, state, shutdown, finished, faults)
            })?;

        Ok(Self {
            state,
            sample_rate,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn timeline(&self) -> MixerTimeline {
        MixerTimeline {
            state: self.state.clone(),
            sample_rate: self.sample_rate,
        }
    }

    /// Stop rendering and wait for the device to be released.
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if tokio::task::spawn_blocking(move || thread.join()).await.is_err() {
                error!("Playback thread could not be joined");
            }
        }
    }
}

impl Drop for OutputEngine {
    fn drop(&mut self) {
        // Thread exits on its own once it sees the flag.
        self.shutdown.store(true, Ordering::Release);
    }
}

fn render_loop(
    mut device: Box<dyn OutputDevice>,
    sample_rate: u32,
    state: Arc<Mutex<MixState>>,
    shutdown: Arc<AtomicBool>,
    finished: UnboundedSender<SourceId>,
    faults: UnboundedSender<DeviceError>,
) {
    let block_len = (sample_rate * BLOCK_MS / 1000).max(1) as usize;
    let mut block = vec![0.0f32; block_len];
    info!("Playback started at {} Hz ({} sample blocks)", sample_rate, block_len);

    while !shutdown.load(Ordering::Acquire) {
        let done = lock(&state).render(&mut block);
        for id in done {
            // Receiver is gone once the session loop has exited.
            let _ = finished.send(id);
        }
        if let Err(e) = device.write(&block) {
            error!("Playback write failed: {}", e);
            let _ = faults.send(e);
            break;
        }
    }

    if let Err(e) = device.flush() {
        debug!("Playback flush failed: {}", e);
    }
    info!("Playback stopped");
}
