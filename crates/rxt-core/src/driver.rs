//! Contract between the core and audio system backends.
//!
//! A backend enumerates devices, opens them, answers format queries and runs streams. Everything
//! above this contract (state machine, safe buffers, aggregation) lives in the core.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::format::{BufferSize, Format, Latency, Mix};
use crate::system::{ServiceCaps, Setup, System};

pub trait Backend: Send + Sync + 'static {
    fn system(&self) -> System;

    fn setup(&self) -> Setup;

    fn capabilities(&self) -> ServiceCaps;

    fn device_count(&self) -> Result<usize>;

    /// Index of the default device for a direction, if there is one.
    fn default_device(&self, output: bool) -> Result<Option<usize>>;

    fn open_device(&self, index: usize) -> Result<Box<dyn DeviceDriver>>;
}

pub trait DeviceDriver: Send + Sync + 'static {
    fn name(&self) -> Result<String>;

    /// The device's natural mix, if it has one.
    fn mix(&self) -> Result<Option<Mix>>;

    fn channel_count(&self, output: bool) -> Result<usize>;

    fn channel_name(&self, output: bool, index: usize) -> Result<String>;

    /// Must not change device state. Unsupported combinations yield `Ok(false)`.
    fn supports_format(&self, format: &Format) -> Result<bool>;

    fn supports_access(&self, interleaved: bool) -> Result<bool>;

    /// Called only with formats for which [`DeviceDriver::supports_format`] returned `true`.
    fn buffer_size(&self, format: &Format) -> Result<BufferSize>;

    /// Opens a stream. The returned stream owns the hardware until dropped.
    fn open_stream(&self, desc: StreamDesc) -> Result<Box<dyn DriverStream>>;
}

pub struct StreamDesc {
    pub format: Format,
    /// Access mode of the buffers handed to the callback. Always one the device supports.
    pub interleaved: bool,
    /// Frames per period. Buffers never carry more.
    pub frames: usize,
    pub callback: Box<dyn DriverCallback>,
}

/// Receives periods on the backend's real-time thread.
pub trait DriverCallback: Send + 'static {
    /// Called once per period. Input memory holds captured audio; output memory must be filled.
    fn on_buffer(&mut self, buffer: &mut Buffer<'_>);

    /// The stream died. No further periods will be delivered until the stream is restarted.
    fn on_fatal(&mut self, error: Error);
}

pub trait DriverStream: Send + 'static {
    fn frames(&self) -> usize;

    fn latency(&self) -> Result<Latency>;

    /// Starts delivering periods on a dedicated thread.
    fn start(&mut self) -> Result<()>;

    /// Stops delivery. When this returns, the callback is no longer running and won't be called
    /// again until the next start.
    fn stop(&mut self) -> Result<()>;
}
