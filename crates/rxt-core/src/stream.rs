use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bumpalo::Bump;
use crossbeam_queue::ArrayQueue;

use crate::buffer::{weave_all, Buffer, Scratch};
use crate::driver::{DriverCallback, DriverStream, StreamDesc};
use crate::error::{Error, ErrorKind, Result};
use crate::format::{BufferSize, Format, Latency};
use crate::platform::PlatformInner;
use crate::safe_buffer::{SafeAccess, SafeSlot};
use crate::service::{Device, DeviceLease};
use crate::system::System;

/// Called once per period on the stream's real-time thread.
///
/// Must not block, allocate without bound, or take locks a non-real-time thread may hold.
pub type BufferCallback = Box<dyn FnMut(&mut Callback<'_, '_>) + Send>;

/// Called with the index of the device that over- or underran. Index 0 for device streams.
pub type XRunCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Parameters shared by device and aggregate streams.
pub struct StreamParams {
    /// Access mode of the buffers handed to the callback.
    pub interleaved: bool,
    pub on_buffer: BufferCallback,
    pub on_xrun: Option<XRunCallback>,
}

impl StreamParams {
    pub fn new(
        interleaved: bool,
        on_buffer: impl FnMut(&mut Callback<'_, '_>) + Send + 'static,
    ) -> StreamParams {
        StreamParams {
            interleaved,
            on_buffer: Box::new(on_buffer),
            on_xrun: None,
        }
    }

    pub fn on_xrun(mut self, on_xrun: impl Fn(usize) + Send + Sync + 'static) -> StreamParams {
        self.on_xrun = Some(Arc::new(on_xrun));
        self
    }
}

impl fmt::Debug for StreamParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamParams")
            .field("interleaved", &self.interleaved)
            .finish_non_exhaustive()
    }
}

pub struct DeviceStreamParams {
    pub stream: StreamParams,
    pub format: Format,
    /// Requested buffer size in milliseconds, clamped into the device's range.
    pub buffer_size: f64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamInfo {
    pub format: Format,
    pub interleaved: bool,
    pub frames: usize,
    /// Device index reported to the x-run callback.
    pub index: usize,
}

/// Context of one callback invocation.
pub struct Callback<'c, 'b> {
    buffer: &'c mut Buffer<'b>,
    info: &'c StreamInfo,
    slot: &'c SafeSlot,
}

impl<'c, 'b> Callback<'c, 'b> {
    pub(crate) fn new(
        buffer: &'c mut Buffer<'b>,
        info: &'c StreamInfo,
        slot: &'c SafeSlot,
    ) -> Callback<'c, 'b> {
        Callback { buffer, info, slot }
    }

    pub fn format(&self) -> &Format {
        &self.info.format
    }

    pub fn is_interleaved(&self) -> bool {
        self.info.interleaved
    }

    /// Frames in this period.
    pub fn frames(&self) -> usize {
        self.buffer.frames
    }

    /// Stream position in frames, if the system reports one.
    pub fn position(&self) -> Option<u64> {
        self.buffer.time_valid.then_some(self.buffer.position)
    }

    /// Whether this period follows an x-run. Its contents are undefined if so.
    pub fn xrun(&self) -> bool {
        self.buffer.xrun
    }

    pub fn buffer(&self) -> &Buffer<'b> {
        &*self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer<'b> {
        &mut *self.buffer
    }

    /// Typed access to the stream's registered [`crate::SafeBuffer`].
    pub fn safe_buffer(&mut self) -> SafeAccess<'_, 'b> {
        SafeAccess::new(self.slot, &mut *self.buffer, &self.info.format)
    }
}

/// State shared between a stream's controller and its callback.
pub(crate) struct StreamShared {
    pub(crate) safe: SafeSlot,
    fatal: ArrayQueue<Error>,
    failed: AtomicBool,
    /// Aggregate members report failures to the aggregate.
    parent: Option<Arc<StreamShared>>,
}

impl StreamShared {
    pub(crate) fn new(parent: Option<Arc<StreamShared>>) -> StreamShared {
        StreamShared {
            safe: SafeSlot::new(),
            fatal: ArrayQueue::new(1),
            failed: AtomicBool::new(false),
            parent,
        }
    }

    /// Records a fatal error. Only the first one of a run is kept.
    pub(crate) fn fail(&self, error: Error) {
        self.failed.store(true, Ordering::Release);
        match &self.parent {
            Some(parent) => parent.fail(error),
            None => {
                let _ = self.fatal.push(error);
            }
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn reset(&self) {
        while self.fatal.pop().is_some() {}
        self.failed.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum StreamState {
    Created,
    Running,
    Stopped,
}

/// An open stream. Owns its device until dropped; dropping a running stream stops it first.
pub struct Stream {
    driver: Box<dyn DriverStream>,
    state: StreamState,
    info: StreamInfo,
    system: System,
    shared: Arc<StreamShared>,
    platform: Arc<PlatformInner>,
    _lease: Option<DeviceLease>,
}

impl Stream {
    pub(crate) fn open(
        device: &Device,
        params: DeviceStreamParams,
        index: usize,
        parent: Option<Arc<StreamShared>>,
    ) -> Result<Stream> {
        let system = device.system();
        let platform = device.platform().clone();
        platform.check("open stream")?;

        let DeviceStreamParams {
            stream: params,
            format,
            buffer_size,
        } = params;

        format.validate().map_err(|e| e.or_system(system))?;
        if !format.has_channels() {
            return Err(Error::new(
                system,
                ErrorKind::InvalidFormat("format must have at least one channel"),
            ));
        }

        if !(buffer_size.is_finite() && buffer_size > 0.0) {
            return Err(Error::new(system, ErrorKind::InvalidBufferSize(buffer_size)));
        }

        if !device.supports_format(&format)? {
            return Err(Error::new(system, ErrorKind::UnsupportedFormat));
        }

        let range = device.buffer_size(&format)?;
        let native_interleaved = negotiate_access(device, params.interleaved)?;
        let frames = negotiate_frames(&format, &range, buffer_size);

        let lease = device.lease()?;

        let info = StreamInfo {
            format,
            interleaved: params.interleaved,
            frames,
            index,
        };
        let shared = Arc::new(StreamShared::new(parent));

        let emulation = (native_interleaved != params.interleaved).then(|| Emulation::new(&info));
        let emulated = emulation.is_some();

        let callback = Dispatcher {
            on_buffer: params.on_buffer,
            on_xrun: params.on_xrun,
            info,
            shared: shared.clone(),
            emulation,
        };

        let desc = StreamDesc {
            format,
            interleaved: native_interleaved,
            frames,
            callback: Box::new(callback),
        };

        let driver = device
            .driver()
            .open_stream(desc)
            .map_err(|e| e.or_system(system))?;

        tracing::debug!(
            %system,
            member = index,
            frames,
            interleaved = info.interleaved,
            emulated,
            "opened stream"
        );

        Ok(Stream::from_parts(
            driver,
            info,
            system,
            shared,
            platform,
            Some(lease),
        ))
    }

    pub(crate) fn from_parts(
        driver: Box<dyn DriverStream>,
        info: StreamInfo,
        system: System,
        shared: Arc<StreamShared>,
        platform: Arc<PlatformInner>,
        lease: Option<DeviceLease>,
    ) -> Stream {
        platform.stream_opened();

        Stream {
            driver,
            state: StreamState::Created,
            info,
            system,
            shared,
            platform,
            _lease: lease,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    pub(crate) fn check_platform(&self, operation: &'static str) -> Result<()> {
        self.platform.check(operation)
    }

    /// Surfaces a fatal error raised on the real-time thread, forcing the stream to `Stopped`.
    fn poll_fatal(&mut self) -> Result<()> {
        if !self.shared.has_failed() {
            return Ok(());
        }

        if self.state == StreamState::Running {
            if let Err(e) = self.driver.stop() {
                tracing::warn!(system = %self.system, "failed to stop dead stream: {e}");
            }
            self.state = StreamState::Stopped;
        }

        match self.shared.fatal.pop() {
            Some(error) => Err(error.or_system(self.system)),
            None => Ok(()),
        }
    }

    /// Starts delivering periods. Fails with `InvalidState` if already running.
    pub fn start(&mut self) -> Result<()> {
        self.platform.check("start stream")?;
        self.poll_fatal()?;

        if self.state == StreamState::Running {
            return Err(Error::invalid_state("start stream", "running").or_system(self.system));
        }

        self.shared.reset();
        self.driver
            .start()
            .map_err(|e| e.or_system(self.system))?;
        self.state = StreamState::Running;

        tracing::debug!(system = %self.system, "stream started");
        Ok(())
    }

    /// Stops delivering periods. No callback runs after this returns.
    ///
    /// Stopping a stream that is not running does nothing, unless a fatal error is pending, in
    /// which case it is returned.
    pub fn stop(&mut self) -> Result<()> {
        self.poll_fatal()?;

        if self.state != StreamState::Running {
            return Ok(());
        }

        let result = self.driver.stop().map_err(|e| e.or_system(self.system));
        self.state = StreamState::Stopped;

        tracing::debug!(system = %self.system, "stream stopped");
        result
    }

    /// Stops the stream if running, then releases it.
    pub fn destroy(mut self) -> Result<()> {
        self.stop()
    }

    pub fn state(&self) -> StreamState {
        if self.state == StreamState::Running && self.shared.has_failed() {
            return StreamState::Stopped;
        }

        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    pub fn latency(&self) -> Result<Latency> {
        self.platform.check("query stream")?;
        self.driver.latency().map_err(|e| e.or_system(self.system))
    }

    /// Maximum frames per period.
    pub fn frames(&self) -> usize {
        self.info.frames
    }

    pub fn format(&self) -> &Format {
        &self.info.format
    }

    pub fn is_interleaved(&self) -> bool {
        self.info.interleaved
    }

    pub fn system(&self) -> System {
        self.system
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.state == StreamState::Running {
            if let Err(e) = self.driver.stop() {
                tracing::warn!(system = %self.system, "failed to stop stream on drop: {e}");
            }
        }

        if self.shared.safe.is_registered() {
            tracing::warn!(system = %self.system, "stream destroyed with a safe buffer registered");
        }

        self.platform.stream_closed();
        tracing::debug!(system = %self.system, "stream destroyed");
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("system", &self.system)
            .field("state", &self.state())
            .field("format", &self.info.format)
            .field("frames", &self.info.frames)
            .finish_non_exhaustive()
    }
}

/// Picks the access mode the device will run in: the requested one if supported, else the other.
fn negotiate_access(device: &Device, interleaved: bool) -> Result<bool> {
    if device.supports_access(interleaved)? {
        return Ok(interleaved);
    }

    if device.supports_access(!interleaved)? {
        return Ok(!interleaved);
    }

    Err(Error::new(device.system(), ErrorKind::UnsupportedAccess))
}

/// Converts a requested buffer size into frames per period, clamped into the device's range.
pub(crate) fn negotiate_frames(format: &Format, range: &BufferSize, requested_ms: f64) -> usize {
    let ms = requested_ms.max(range.min).min(range.max);
    let ms = if ms.is_finite() && ms > 0.0 {
        ms
    } else {
        requested_ms
    };

    let frames = (format.mix.rate() as f64 * ms / 1000.0).round();
    (frames as usize).max(1)
}

/// Intermediate buffers used when the device can't run in the requested access mode.
struct Emulation {
    input: Option<Scratch>,
    output: Option<Scratch>,
    bump: Bump,
}

impl Emulation {
    fn new(info: &StreamInfo) -> Emulation {
        let sample = info.format.mix.sample();
        let scratch = |output: bool| {
            let layout = info.format.layout(output);
            (layout.channels > 0)
                .then(|| Scratch::new(info.interleaved, sample, layout, info.frames))
        };

        // Holds the per-channel slice tables of both directions, reused after each reset.
        let channels = info.format.channels.inputs + info.format.channels.outputs;
        let bump = Bump::with_capacity(2 * channels * std::mem::size_of::<&mut [u8]>());

        Emulation {
            input: scratch(false),
            output: scratch(true),
            bump,
        }
    }

    fn run(&mut self, native: &mut Buffer<'_>, info: &StreamInfo, f: impl FnOnce(&mut Buffer<'_>)) {
        self.bump.reset();

        let frames = native.frames.min(info.frames);
        let in_layout = info.format.layout(false);
        let out_layout = info.format.layout(true);

        if let (Some(scratch), Some(src)) = (&mut self.input, &native.input) {
            weave_all(scratch, in_layout, 0, src, in_layout, frames);
        }

        if let Some(scratch) = &mut self.output {
            scratch.silence();
        }

        {
            let bump = &self.bump;
            let mut user = Buffer {
                frames,
                input: self.input.as_ref().map(|s| s.input(bump, frames)),
                output: self.output.as_mut().map(|s| s.output(bump, frames)),
                position: native.position,
                time_valid: native.time_valid,
                xrun: native.xrun,
            };
            f(&mut user);
        }

        if let (Some(scratch), Some(dst)) = (&self.output, &mut native.output) {
            weave_all(dst, out_layout, 0, scratch, out_layout, frames);
        }
    }
}

/// Adapts the user callback to the backend contract.
struct Dispatcher {
    on_buffer: BufferCallback,
    on_xrun: Option<XRunCallback>,
    info: StreamInfo,
    shared: Arc<StreamShared>,
    emulation: Option<Emulation>,
}

impl DriverCallback for Dispatcher {
    fn on_buffer(&mut self, buffer: &mut Buffer<'_>) {
        let Dispatcher {
            on_buffer,
            on_xrun,
            info,
            shared,
            emulation,
        } = self;
        let info = &*info;

        if buffer.xrun {
            if let Some(on_xrun) = on_xrun {
                on_xrun(info.index);
            }
        }

        match emulation {
            None => on_buffer(&mut Callback::new(buffer, info, &shared.safe)),
            Some(emulation) => emulation.run(buffer, info, |user| {
                on_buffer(&mut Callback::new(user, info, &shared.safe))
            }),
        }
    }

    fn on_fatal(&mut self, error: Error) {
        tracing::warn!(device = self.info.index, "stream failed: {error}");
        self.shared.fail(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Channels, Mix, SampleType};

    fn format(rate: u32) -> Format {
        Format::new(
            Mix::new(rate, SampleType::F32).unwrap(),
            Channels::output(2),
        )
    }

    #[test]
    fn frames_follow_requested_size() {
        let range = BufferSize {
            min: 1.0,
            max: 100.0,
            current: 10.0,
        };

        assert_eq!(negotiate_frames(&format(48000), &range, 10.0), 480);
        assert_eq!(negotiate_frames(&format(44100), &range, 512.0 / 44.1), 512);
    }

    #[test]
    fn frames_are_clamped_into_range() {
        let range = BufferSize {
            min: 5.0,
            max: 20.0,
            current: 10.0,
        };

        assert_eq!(negotiate_frames(&format(48000), &range, 1.0), 240);
        assert_eq!(negotiate_frames(&format(48000), &range, 500.0), 960);
    }

    #[test]
    fn fatal_errors_reach_the_parent() {
        let parent = Arc::new(StreamShared::new(None));
        let member = StreamShared::new(Some(parent.clone()));

        member.fail(Error::new(System::Simulated, ErrorKind::DeviceLost));
        assert!(member.has_failed());
        assert!(member.fatal.is_empty());
        assert!(parent.has_failed());

        let error = parent.fatal.pop().unwrap();
        assert!(matches!(error.kind(), ErrorKind::DeviceLost));

        parent.reset();
        assert!(!parent.has_failed());
    }

    #[test]
    fn emulation_reshapes_buffers() {
        let info = StreamInfo {
            format: Format::new(
                Mix::new(48000, SampleType::I16).unwrap(),
                Channels::duplex(2, 2),
            ),
            interleaved: false,
            frames: 2,
            index: 0,
        };
        let mut emulation = Emulation::new(&info);

        let input: Vec<u8> = [1i16, 2, 3, 4].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut output = [0u8; 8];
        let mut native = Buffer {
            frames: 2,
            input: Some(crate::buffer::NativeInput::Interleaved(&input)),
            output: Some(crate::buffer::NativeOutput::Interleaved(&mut output)),
            position: 0,
            time_valid: false,
            xrun: false,
        };

        emulation.run(&mut native, &info, |user| {
            use crate::buffer::{NativeInput, NativeOutput};

            let Some(NativeInput::NonInterleaved(planes)) = user.input else {
                panic!("expected planar input");
            };
            assert_eq!(planes[0], [1i16, 3].map(i16::to_ne_bytes).concat());
            assert_eq!(planes[1], [2i16, 4].map(i16::to_ne_bytes).concat());

            let Some(NativeOutput::NonInterleaved(out)) = &mut user.output else {
                panic!("expected planar output");
            };
            out[1][..2].copy_from_slice(&7i16.to_ne_bytes());
        });
        drop(native);

        let samples: Vec<i16> = output
            .chunks(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, [0, 7, 0, 0]);
    }
}
