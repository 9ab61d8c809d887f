//! Audio device seam
//!
//! The session only talks to these traits; the PulseAudio implementation lives
//! in `pulse` and tests substitute in-memory devices.

/// Error for audio device operations
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device could not be opened (missing, busy, or access refused).
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    #[error("audio device I/O failed: {0}")]
    Io(String),
}

/// Blocking source of normalized mono samples.
pub trait InputDevice: Send {
    /// Fill `frame` completely, blocking at the device's natural cadence.
    fn read(&mut self, frame: &mut [f32]) -> Result<(), DeviceError>;
}

/// Blocking sink of normalized mono samples.
pub trait OutputDevice: Send {
    /// Queue `block` for playback; blocks while the device buffer is full.
    fn write(&mut self, block: &[f32]) -> Result<(), DeviceError>;

    /// Drop whatever is still buffered in the device.
    fn flush(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Opens devices at a fixed rate, mono.
pub trait AudioBackend: Send + Sync + 'static {
    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputDevice>, DeviceError>;
    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>, DeviceError>;
}
