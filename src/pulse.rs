//! PulseAudio devices
//!
//! Record and playback streams through PulseAudio's simple API, opened as
//! 32-bit float little-endian mono at the rate the session asks for.

use crate::device::{AudioBackend, DeviceError, InputDevice, OutputDevice};
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use tracing::info;

const BYTES_PER_SAMPLE: usize = 4;

/// Target playback buffer; bounds how much already-queued speech can still be
/// heard after an interruption.
const PLAYBACK_BUFFER_MS: u32 = 100;

/// Opens PulseAudio streams on the default server.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    /// Source name; `None` records from the default source.
    input_device: Option<String>,
    /// Sink name; `None` plays to the default sink.
    output_device: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            input_device: None,
            output_device: None,
        }
    }

    pub fn with_input_device(mut self, name: &str) -> Self {
        self.input_device = Some(name.to_string());
        self
    }

    pub fn with_output_device(mut self, name: &str) -> Self {
        self.output_device = Some(name.to_string());
        self
    }

    fn spec(sample_rate: u32) -> Result<Spec, DeviceError> {
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: sample_rate,
        };
        if !spec.is_valid() {
            return Err(DeviceError::Unavailable(format!(
                "invalid sample spec: {} Hz mono",
                sample_rate
            )));
        }
        Ok(spec)
    }
}

impl AudioBackend for PulseBackend {
    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputDevice>, DeviceError> {
        let spec = Self::spec(sample_rate)?;
        let simple = Simple::new(
            None,
            &self.app_name,
            Direction::Record,
            self.input_device.as_deref(),
            "microphone",
            &spec,
            None,
            None,
        )
        .map_err(|e| DeviceError::Unavailable(format!("microphone: {}", e)))?;

        info!(
            "Microphone opened: {} at {} Hz",
            self.input_device.as_deref().unwrap_or("default source"),
            sample_rate
        );
        Ok(Box::new(PulseInput {
            simple,
            bytes: Vec::new(),
        }))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>, DeviceError> {
        let spec = Self::spec(sample_rate)?;
        let target = sample_rate * PLAYBACK_BUFFER_MS / 1000 * BYTES_PER_SAMPLE as u32;
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: target,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        };
        let simple = Simple::new(
            None,
            &self.app_name,
            Direction::Playback,
            self.output_device.as_deref(),
            "speech",
            &spec,
            None,
            Some(&attr),
        )
        .map_err(|e| DeviceError::Unavailable(format!("speaker: {}", e)))?;

        info!(
            "Speaker opened: {} at {} Hz",
            self.output_device.as_deref().unwrap_or("default sink"),
            sample_rate
        );
        Ok(Box::new(PulseOutput {
            simple,
            bytes: Vec::new(),
        }))
    }
}

struct PulseInput {
    simple: Simple,
    bytes: Vec<u8>,
}

impl InputDevice for PulseInput {
    fn read(&mut self, frame: &mut [f32]) -> Result<(), DeviceError> {
        self.bytes.resize(frame.len() * BYTES_PER_SAMPLE, 0);
        self.simple
            .read(&mut self.bytes)
            .map_err(|e| DeviceError::Io(ToString::to_string(&e)))?;
        for (sample, raw) in frame.iter_mut().zip(self.bytes.chunks_exact(BYTES_PER_SAMPLE)) {
            *sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Ok(())
    }
}

struct PulseOutput {
    simple: Simple,
    bytes: Vec<u8>,
}

impl OutputDevice for PulseOutput {
    fn write(&mut self, block: &[f32]) -> Result<(), DeviceError> {
        self.bytes.clear();
        self.bytes.extend(block.iter().flat_map(|s| s.to_le_bytes()));
        self.simple
            .write(&self.bytes)
            .map_err(|e| DeviceError::Io(ToString::to_string(&e)))
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.simple.flush().map_err(|e| DeviceError::Io(ToString::to_string(&e)))
    }
}
