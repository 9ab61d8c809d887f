//! Microphone capture pipeline
//!
//! Reads fixed-size frames from the input device on a dedicated thread,
//! publishes each frame's loudness, and forwards the encoded frame to the
//! remote channel. Sends are fire-and-forget so the capture cadence never
//! waits on the network.

use crate::channel::ChannelHandle;
use crate::codec::{self, AudioFrame, EncodedChunk, INPUT_SAMPLE_RATE};
use crate::device::{DeviceError, InputDevice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Capture format
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Samples per frame (4096 at 16 kHz is 256 ms).
    pub frame_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            frame_samples: 4096,
        }
    }
}

/// Loudness and wire form of one frame.
pub fn process_frame(frame: &AudioFrame) -> (f32, EncodedChunk) {
    (codec::rms(&frame.samples), codec::encode_frame(frame))
}

/// Where captured frames go.
pub struct CaptureSinks {
    pub channel: ChannelHandle,
    pub amplitude: Arc<watch::Sender<f32>>,
    /// Receives the error if the device fails while capturing.
    pub faults: UnboundedSender<DeviceError>,
}

#[derive(Default)]
struct Flags {
    running: AtomicBool,
    /// Frames are only forwarded once the session is live.
    live: AtomicBool,
}

pub struct CapturePipeline {
    flags: Arc<Flags>,
    thread: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Start reading from `device`. Frames are read and dropped until
    /// [`begin`](Self::begin) is called. The device is owned by the capture
    /// thread and released when the thread exits.
    pub fn spawn(
        device: Box<dyn InputDevice>,
        config: CaptureConfig,
        sinks: CaptureSinks,
    ) -> std::io::Result<Self> {
        let flags = Arc::new(Flags::default());
        flags.running.store(true, Ordering::Release);

        let thread = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn({
                let flags = flags.clone();
                move || capture_loop(device, config, sinks, flags)
            })?;

        Ok(Self {
            flags,
            thread: Some(thread),
        })
    }

    /// Start forwarding frames.
    pub fn begin(&self) {
        self.flags.live.store(true, Ordering::Release);
    }

    /// Stop emitting frames. The frame currently being read is discarded.
    pub fn stop(&self) {
        self.flags.live.store(false, Ordering::Release);
        self.flags.running.store(false, Ordering::Release);
    }

    /// Stop and wait until the input device has been released.
    pub async fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if tokio::task::spawn_blocking(move || thread.join()).await.is_err() {
                error!("Capture thread could not be joined");
            }
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut device: Box<dyn InputDevice>,
    config: CaptureConfig,
    sinks: CaptureSinks,
    flags: Arc<Flags>,
) {
    info!(
        "Capture started: {} samples per frame at {} Hz",
        config.frame_samples, config.sample_rate
    );
    let mut frames = 0u64;
    let mut buffer = vec![0.0f32; config.frame_samples];

    while flags.running.load(Ordering::Acquire) {
        if let Err(e) = device.read(&mut buffer) {
            error!("Microphone read failed: {}", e);
            let _ = sinks.faults.send(e);
            break;
        }
        if !flags.live.load(Ordering::Acquire) {
            continue;
        }

        let frame = AudioFrame::new(buffer.clone(), config.sample_rate);
        let (level, chunk) = process_frame(&frame);
        sinks.amplitude.send_replace(level);

        if !sinks.channel.send_audio(chunk) {
            warn!("Channel closed, stopping capture");
            break;
        }
        frames += 1;
        if frames % 100 == 0 {
            debug!("Captured {} frames", frames);
        }
    }

    sinks.amplitude.send_replace(0.0);
    info!("Capture stopped after {} frames", frames);
}
