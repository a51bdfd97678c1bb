//! Several devices driven as one stream.
//!
//! Every member runs its own stream. Members push captured frames into a per-member input ring
//! and pull playback frames from a per-member output ring. The master member additionally merges
//! all input rings into one buffer, runs the user callback, and splits its output back into the
//! output rings. A member that falls behind never blocks the master: its most recent frames are
//! reused, and an x-run is reported for it once it stays behind for longer than the drift policy
//! allows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bumpalo::Bump;

use crate::buffer::{unweave_all, weave_all, Buffer, Layout, NativeInput, Scratch};
use crate::driver::DriverStream;
use crate::error::{Error, ErrorKind, Result};
use crate::format::{Channels, Format, Latency, Mix, SampleType};
use crate::sample::fill_silence;
use crate::service::{Device, DeviceId, Service};
use crate::stream::{
    negotiate_frames, BufferCallback, Callback, DeviceStreamParams, Stream, StreamInfo,
    StreamParams, StreamShared, XRunCallback,
};
use crate::sync::ring::{self, Consumer, Producer, RingHandle};

/// One member of an aggregate stream.
pub struct AggregateDeviceParams {
    pub device: Device,
    /// Channels this member contributes, in order, to the merged buffer.
    pub channels: Channels,
    /// Buffer size of this member in milliseconds.
    pub buffer_size: f64,
}

/// How long a member may lag behind the master before an x-run is reported for it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DriftPolicy {
    /// Consecutive master periods a member may miss. While missing, its last frames are reused.
    pub max_stale_periods: usize,
}

impl DriftPolicy {
    /// Largest accepted `max_stale_periods`.
    pub const MAX_STALE_PERIODS: usize = 64;
}

impl Default for DriftPolicy {
    fn default() -> DriftPolicy {
        DriftPolicy {
            max_stale_periods: 1,
        }
    }
}

pub struct AggregateParams {
    pub stream: StreamParams,
    pub devices: Vec<AggregateDeviceParams>,
    pub mix: Mix,
    /// The member whose periods drive the user callback.
    pub master: DeviceId,
    pub drift: DriftPolicy,
}

impl Service {
    /// Combines several devices, possibly of other systems, into one stream.
    ///
    /// The merged buffer carries the members' input channels followed one another in member
    /// order, and likewise for outputs.
    pub fn aggregate_stream(&self, params: AggregateParams) -> Result<Stream> {
        open(self, params)
    }
}

/// Counts consecutive short periods of one ring, reporting once per episode.
#[derive(Debug, Default)]
struct StaleGate {
    stale: usize,
    reported: bool,
}

impl StaleGate {
    /// Records a short period. Returns `true` when an x-run should be reported.
    fn miss(&mut self, tolerance: usize) -> bool {
        self.stale += 1;
        if self.stale > tolerance && !self.reported {
            self.reported = true;
            return true;
        }

        false
    }

    fn hit(&mut self) {
        self.stale = 0;
        self.reported = false;
    }
}

fn report(on_xrun: &Option<XRunCallback>, index: usize) {
    tracing::warn!(member = index, "aggregate member out of step");
    if let Some(on_xrun) = on_xrun {
        on_xrun(index);
    }
}

/// Ring side of one member, run on that member's thread.
struct MemberIo {
    index: usize,
    sample: SampleType,
    in_layout: Layout,
    out_layout: Layout,
    input: Option<Producer>,
    output: Option<Consumer>,
    in_scratch: Scratch,
    out_scratch: Scratch,
    in_gate: StaleGate,
    out_gate: StaleGate,
    tolerance: usize,
    /// Output frames that may queue up beyond the period being read.
    slack: usize,
    on_xrun: Option<XRunCallback>,
}

impl MemberIo {
    fn process(&mut self, buffer: &mut Buffer<'_>, running: bool) {
        let frames = buffer.frames;

        if !running {
            if let Some(native) = &mut buffer.output {
                native.silence(self.sample, self.out_layout, frames);
            }
            return;
        }

        let MemberIo {
            index,
            sample,
            in_layout,
            out_layout,
            input,
            output,
            in_scratch,
            out_scratch,
            in_gate,
            out_gate,
            tolerance,
            slack,
            on_xrun,
        } = self;

        if let (Some(producer), Some(native)) = (input, &buffer.input) {
            let bytes = match native {
                NativeInput::Interleaved(data) => &data[..frames * in_layout.frame_size()],
                NativeInput::NonInterleaved(_) => {
                    weave_all(in_scratch, *in_layout, 0, native, *in_layout, frames);
                    in_scratch.bytes(frames)
                }
            };

            // A full ring means the master stopped consuming; the frames are lost.
            if producer.write(bytes) < frames {
                if in_gate.miss(0) {
                    report(on_xrun, *index);
                }
            } else {
                in_gate.hit();
            }
        }

        if let (Some(consumer), Some(native)) = (output, &mut buffer.output) {
            let frame_size = out_layout.frame_size();

            // A member that started late drops back to one period behind the master.
            let backlog = consumer.len();
            if backlog > frames.saturating_add(*slack) {
                consumer.skip(backlog - frames);
            }

            let bytes = out_scratch.bytes_mut(frames);
            let read = consumer.read(bytes);

            if read < frames {
                fill_silence(*sample, &mut bytes[read * frame_size..]);
                if out_gate.miss(*tolerance) {
                    report(on_xrun, *index);
                }
            } else {
                out_gate.hit();
            }

            weave_all(native, *out_layout, 0, &*out_scratch, *out_layout, frames);
        }
    }
}

struct InputTap {
    index: usize,
    /// First channel of this member in the merged input.
    offset: usize,
    layout: Layout,
    consumer: Consumer,
    /// Last frames received, reused while the member is behind.
    scratch: Scratch,
    gate: StaleGate,
}

struct OutputTap {
    index: usize,
    offset: usize,
    layout: Layout,
    producer: Producer,
    scratch: Scratch,
    gate: StaleGate,
}

struct AggregateShared {
    running: AtomicBool,
    outer: Arc<StreamShared>,
}

impl AggregateShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.outer.has_failed()
    }
}

/// Merge/split side, run on the master member's thread.
struct MasterIo {
    own: MemberIo,
    shared: Arc<AggregateShared>,
    info: StreamInfo,
    inputs: Vec<InputTap>,
    outputs: Vec<OutputTap>,
    app_in: Option<Scratch>,
    app_out: Option<Scratch>,
    bump: Bump,
    on_buffer: BufferCallback,
    on_xrun: Option<XRunCallback>,
    tolerance: usize,
}

impl MasterIo {
    fn process(&mut self, buffer: &mut Buffer<'_>) {
        let running = self.shared.is_running();
        self.own.process(buffer, running);
        if !running {
            return;
        }

        self.bump.reset();

        let frames = buffer.frames.min(self.info.frames);
        let in_layout = self.info.format.layout(false);
        let out_layout = self.info.format.layout(true);
        let backlog_limit = frames.saturating_mul(self.tolerance.saturating_add(1));

        for tap in &mut self.inputs {
            let read = tap.consumer.read(tap.scratch.bytes_mut(frames));
            if read < frames {
                if tap.gate.miss(self.tolerance) {
                    report(&self.on_xrun, tap.index);
                }
            } else {
                tap.gate.hit();
            }

            // A member running ahead would otherwise add latency without bound.
            let backlog = tap.consumer.len();
            if backlog > backlog_limit {
                tap.consumer.skip(backlog - backlog_limit);
            }

            if let Some(app_in) = &mut self.app_in {
                weave_all(app_in, in_layout, tap.offset, &tap.scratch, tap.layout, frames);
            }
        }

        if let Some(app_out) = &mut self.app_out {
            app_out.silence();
        }

        {
            let bump = &self.bump;
            let mut user = Buffer {
                frames,
                input: self.app_in.as_ref().map(|s| s.input(bump, frames)),
                output: self.app_out.as_mut().map(|s| s.output(bump, frames)),
                position: buffer.position,
                time_valid: buffer.time_valid,
                xrun: buffer.xrun,
            };

            let mut callback = Callback::new(&mut user, &self.info, &self.shared.outer.safe);
            (self.on_buffer)(&mut callback);
        }

        if let Some(app_out) = &self.app_out {
            for tap in &mut self.outputs {
                unweave_all(&mut tap.scratch, tap.layout, app_out, out_layout, tap.offset, frames);
                if tap.producer.write(tap.scratch.bytes(frames)) < frames {
                    if tap.gate.miss(0) {
                        report(&self.on_xrun, tap.index);
                    }
                } else {
                    tap.gate.hit();
                }
            }
        }
    }
}

/// Drives the member streams on behalf of the aggregate's controller.
struct AggregateDriver {
    members: Vec<Stream>,
    master: usize,
    shared: Arc<AggregateShared>,
    /// Per member: input ring, output ring.
    rings: Vec<(Option<RingHandle>, Option<RingHandle>)>,
    frames: usize,
    rate: u32,
}

impl DriverStream for AggregateDriver {
    fn frames(&self) -> usize {
        self.frames
    }

    fn latency(&self) -> Result<Latency> {
        let to_ms = |frames: usize| frames as f64 * 1000.0 / self.rate as f64;

        let mut latency = Latency::default();
        for (member, (input, output)) in self.members.iter().zip(&self.rings) {
            let own = member.latency()?;
            if let Some(ring) = input {
                latency.input = latency.input.max(own.input + to_ms(ring.len()));
            }
            if let Some(ring) = output {
                latency.output = latency.output.max(own.output + to_ms(ring.len()));
            }
        }

        Ok(latency)
    }

    fn start(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);

        for ring in self.rings.iter().flat_map(|(i, o)| [i, o]).flatten() {
            // SAFETY: all members are stopped, so no callback touches the rings.
            unsafe { ring.reset() };
        }

        let order = (0..self.members.len())
            .filter(|&i| i != self.master)
            .chain([self.master]);

        let mut started = Vec::with_capacity(self.members.len());
        for index in order {
            if let Err(error) = self.members[index].start() {
                tracing::warn!(member = index, "aggregate start failed, rolling back: {error}");
                for &index in started.iter().rev() {
                    let member: &mut Stream = &mut self.members[index];
                    if let Err(e) = member.stop() {
                        tracing::warn!(member = index, "rollback stop failed: {e}");
                    }
                }
                return Err(error);
            }
            started.push(index);
        }

        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);

        let order = [self.master]
            .into_iter()
            .chain((0..self.members.len()).filter(|&i| i != self.master));

        let mut result = Ok(());
        for index in order {
            if let Err(e) = self.members[index].stop() {
                tracing::warn!(member = index, "failed to stop member: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }
}

struct Member {
    format: Format,
    frames: usize,
    in_offset: usize,
    out_offset: usize,
}

fn open(service: &Service, params: AggregateParams) -> Result<Stream> {
    let system = service.system();
    let platform = service.platform().clone();
    platform.check("open aggregate stream")?;

    let AggregateParams {
        stream,
        devices,
        mix,
        master,
        drift,
    } = params;

    if devices.is_empty() {
        return Err(Error::new(system, ErrorKind::DeviceCountMismatch(0)));
    }

    let master = devices
        .iter()
        .position(|d| d.device.id() == master)
        .ok_or_else(|| {
            Error::new(
                system,
                ErrorKind::InvalidConfiguration("master device is not a member".into()),
            )
        })?;

    mix.validate().map_err(|e| e.or_system(system))?;

    if drift.max_stale_periods > DriftPolicy::MAX_STALE_PERIODS {
        return Err(Error::new(
            system,
            ErrorKind::InvalidConfiguration(format!(
                "drift tolerance of {} periods exceeds {}",
                drift.max_stale_periods,
                DriftPolicy::MAX_STALE_PERIODS
            )),
        ));
    }

    // Validate everything before opening anything.
    let mut members = Vec::with_capacity(devices.len());
    let (mut inputs, mut outputs) = (0, 0);
    for (index, d) in devices.iter().enumerate() {
        let format = Format::new(mix, d.channels);
        if !format.has_channels() {
            return Err(Error::new(
                system,
                ErrorKind::InvalidConfiguration(format!("member {index} has no channels")),
            ));
        }

        if !(d.buffer_size.is_finite() && d.buffer_size > 0.0) {
            return Err(Error::new(
                d.device.system(),
                ErrorKind::InvalidBufferSize(d.buffer_size),
            ));
        }

        if !d.device.supports_format(&format)? {
            return Err(Error::new(d.device.system(), ErrorKind::UnsupportedFormat));
        }

        let range = d.device.buffer_size(&format)?;
        members.push(Member {
            format,
            frames: negotiate_frames(&format, &range, d.buffer_size),
            in_offset: inputs,
            out_offset: outputs,
        });

        inputs += d.channels.inputs;
        outputs += d.channels.outputs;
    }

    let max_frames = members.iter().map(|m| m.frames).max().unwrap_or(1);
    let too_large = || {
        Error::new(
            system,
            ErrorKind::InvalidConfiguration(format!(
                "{max_frames} frames per period do not fit the aggregate rings"
            )),
        )
    };
    let slack = max_frames
        .checked_mul(drift.max_stale_periods)
        .ok_or_else(too_large)?;
    let ring_frames = drift
        .max_stale_periods
        .checked_add(2)
        .and_then(|periods| periods.checked_mul(max_frames))
        .filter(|frames| frames.checked_next_power_of_two().is_some())
        .ok_or_else(too_large)?;
    let sample = mix.sample();
    let interleaved = stream.interleaved;

    let format = Format::new(mix, Channels::duplex(inputs, outputs));
    let info = StreamInfo {
        format,
        interleaved,
        frames: max_frames,
        index: master,
    };

    let outer = Arc::new(StreamShared::new(None));
    let shared = Arc::new(AggregateShared {
        running: AtomicBool::new(false),
        outer: outer.clone(),
    });

    let mut ios = Vec::with_capacity(members.len());
    let mut in_taps = Vec::new();
    let mut out_taps = Vec::new();
    let mut rings = Vec::with_capacity(members.len());

    for (index, member) in members.iter().enumerate() {
        let in_layout = member.format.layout(false);
        let out_layout = member.format.layout(true);

        let mut producer = None;
        let mut in_handle = None;
        if in_layout.channels > 0 {
            let (p, consumer) = ring::ring(ring_frames, in_layout.frame_size());
            in_handle = Some(p.handle());
            producer = Some(p);
            in_taps.push(InputTap {
                index,
                offset: member.in_offset,
                layout: in_layout,
                consumer,
                scratch: Scratch::new(true, sample, in_layout, max_frames),
                gate: StaleGate::default(),
            });
        }

        let mut consumer = None;
        let mut out_handle = None;
        if out_layout.channels > 0 {
            let (p, c) = ring::ring(ring_frames, out_layout.frame_size());
            out_handle = Some(c.handle());
            consumer = Some(c);
            out_taps.push(OutputTap {
                index,
                offset: member.out_offset,
                layout: out_layout,
                producer: p,
                scratch: Scratch::new(true, sample, out_layout, max_frames),
                gate: StaleGate::default(),
            });
        }

        rings.push((in_handle, out_handle));
        ios.push(MemberIo {
            index,
            sample,
            in_layout,
            out_layout,
            input: producer,
            output: consumer,
            in_scratch: Scratch::new(true, sample, in_layout, member.frames),
            out_scratch: Scratch::new(true, sample, out_layout, member.frames),
            in_gate: StaleGate::default(),
            out_gate: StaleGate::default(),
            tolerance: drift.max_stale_periods,
            slack,
            on_xrun: stream.on_xrun.clone(),
        });
    }

    let app_scratch = |output: bool| {
        let layout = format.layout(output);
        (layout.channels > 0).then(|| Scratch::new(interleaved, sample, layout, max_frames))
    };

    let mut master_io = Some(MasterIo {
        own: ios.remove(master),
        shared: shared.clone(),
        info,
        inputs: in_taps,
        outputs: out_taps,
        app_in: app_scratch(false),
        app_out: app_scratch(true),
        bump: Bump::with_capacity(2 * (inputs + outputs) * std::mem::size_of::<&mut [u8]>()),
        on_buffer: stream.on_buffer,
        on_xrun: stream.on_xrun.clone(),
        tolerance: drift.max_stale_periods,
    });

    let mut ios = ios.into_iter();
    let mut streams = Vec::with_capacity(devices.len());

    for (index, (d, member)) in devices.iter().zip(&members).enumerate() {
        let on_buffer: BufferCallback = if index == master {
            let mut io = master_io.take().ok_or_else(|| {
                Error::new(
                    system,
                    ErrorKind::InvalidConfiguration("master listed twice".into()),
                )
            })?;
            Box::new(move |cb: &mut Callback<'_, '_>| io.process(cb.buffer_mut()))
        } else {
            let mut io = ios.next().ok_or_else(|| {
                Error::new(
                    system,
                    ErrorKind::InvalidConfiguration("member count changed".into()),
                )
            })?;
            let shared = shared.clone();
            Box::new(move |cb: &mut Callback<'_, '_>| {
                io.process(cb.buffer_mut(), shared.is_running())
            })
        };

        let params = DeviceStreamParams {
            stream: StreamParams {
                interleaved,
                on_buffer,
                on_xrun: stream.on_xrun.clone(),
            },
            format: member.format,
            buffer_size: d.buffer_size,
        };

        streams.push(Stream::open(&d.device, params, index, Some(outer.clone()))?);
    }

    tracing::debug!(
        %system,
        members = streams.len(),
        master,
        frames = max_frames,
        ring_frames,
        "opened aggregate stream"
    );

    let driver = AggregateDriver {
        members: streams,
        master,
        shared,
        rings,
        frames: max_frames,
        rate: mix.rate(),
    };

    Ok(Stream::from_parts(
        Box::new(driver),
        info,
        system,
        outer,
        platform,
        None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_reports_once_per_episode() {
        let mut gate = StaleGate::default();

        assert!(!gate.miss(2));
        assert!(!gate.miss(2));
        assert!(gate.miss(2));
        assert!(!gate.miss(2));

        gate.hit();
        assert!(!gate.miss(2));
        assert!(!gate.miss(2));
        assert!(gate.miss(2));
    }

    #[test]
    fn zero_tolerance_reports_immediately() {
        let mut gate = StaleGate::default();
        assert!(gate.miss(0));
        assert!(!gate.miss(0));
        gate.hit();
        gate.hit();
        assert!(gate.miss(0));
    }

    #[test]
    fn member_forwards_input_and_silences_underflow() {
        let layout = Layout {
            channels: 1,
            sample_size: 1,
        };
        let (producer, mut in_consumer) = ring::ring(8, 1);
        let (mut out_producer, consumer) = ring::ring(8, 1);

        let xruns = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = xruns.clone();

        let mut io = MemberIo {
            index: 3,
            sample: SampleType::U8,
            in_layout: layout,
            out_layout: layout,
            input: Some(producer),
            output: Some(consumer),
            in_scratch: Scratch::new(true, SampleType::U8, layout, 4),
            out_scratch: Scratch::new(true, SampleType::U8, layout, 4),
            in_gate: StaleGate::default(),
            out_gate: StaleGate::default(),
            tolerance: 0,
            slack: 4,
            on_xrun: Some(Arc::new(move |index| {
                assert_eq!(index, 3);
                counter.fetch_add(1, Ordering::Relaxed);
            })),
        };

        out_producer.write(&[10, 11]);

        let input = [1u8, 2, 3, 4];
        let mut output = [0u8; 4];
        let mut buffer = Buffer {
            frames: 4,
            input: Some(NativeInput::Interleaved(&input)),
            output: Some(crate::buffer::NativeOutput::Interleaved(&mut output)),
            position: 0,
            time_valid: true,
            xrun: false,
        };
        io.process(&mut buffer, true);
        drop(buffer);

        let mut captured = [0u8; 4];
        assert_eq!(in_consumer.read(&mut captured), 4);
        assert_eq!(captured, input);
        assert_eq!(output, [10, 11, 128, 128]);
        assert_eq!(xruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn late_output_member_drops_back_one_period() {
        let layout = Layout {
            channels: 1,
            sample_size: 1,
        };
        let (mut producer, consumer) = ring::ring(16, 1);

        let xruns = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = xruns.clone();

        let mut io = MemberIo {
            index: 0,
            sample: SampleType::U8,
            in_layout: Layout {
                channels: 0,
                sample_size: 1,
            },
            out_layout: layout,
            input: None,
            output: Some(consumer),
            in_scratch: Scratch::new(true, SampleType::U8, layout, 4),
            out_scratch: Scratch::new(true, SampleType::U8, layout, 4),
            in_gate: StaleGate::default(),
            out_gate: StaleGate::default(),
            tolerance: 1,
            slack: 4,
            on_xrun: Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })),
        };

        // Three periods queued while the member was not yet running.
        let queued: Vec<u8> = (1..=12).collect();
        assert_eq!(producer.write(&queued), 12);

        let mut output = [0u8; 4];
        let mut buffer = Buffer {
            frames: 4,
            input: None,
            output: Some(crate::buffer::NativeOutput::Interleaved(&mut output)),
            position: 0,
            time_valid: true,
            xrun: false,
        };
        io.process(&mut buffer, true);
        drop(buffer);

        assert_eq!(output, [9, 10, 11, 12]);
        assert_eq!(producer.free(), 16);

        // Within the drift tolerance nothing is dropped.
        assert_eq!(producer.write(&[1, 2, 3, 4, 5, 6, 7, 8]), 8);
        let mut output = [0u8; 4];
        let mut buffer = Buffer {
            frames: 4,
            input: None,
            output: Some(crate::buffer::NativeOutput::Interleaved(&mut output)),
            position: 0,
            time_valid: true,
            xrun: false,
        };
        io.process(&mut buffer, true);
        drop(buffer);

        assert_eq!(output, [1, 2, 3, 4]);
        assert_eq!(producer.free(), 12);
        assert_eq!(xruns.load(Ordering::Relaxed), 0);
    }
}
