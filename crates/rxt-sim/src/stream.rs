use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bumpalo::Bump;
use rxt_core::buffer::{Buffer, NativeInput, NativeOutput};
use rxt_core::driver::{DriverCallback, DriverStream, StreamDesc};
use rxt_core::sample::{encode, fill_silence};
use rxt_core::{Format, Latency, System};
use thread_priority::ThreadPriority;

use crate::config::FaultPlan;
use crate::signal::Signal;
use crate::tap::TapWriter;
use crate::{Error, Result, SimState};

/// Everything the period thread owns. Handed back on join so the stream can be restarted.
struct Engine {
    system: System,
    callback: Box<dyn DriverCallback>,
    format: Format,
    interleaved: bool,
    frames: usize,
    signal: Signal,
    faults: FaultPlan,
    input: Vec<Vec<u8>>,
    output: Vec<Vec<u8>>,
    tap: Option<TapWriter>,
    bump: Bump,
    position: u64,
}

impl Engine {
    fn period(&self) -> Duration {
        Duration::from_secs_f64(self.frames as f64 / self.format.mix.rate() as f64)
    }

    fn generate_input(&mut self) {
        let sample = self.format.mix.sample();
        let size = sample.size();
        let channels = self.format.channels.inputs;
        let rate = self.format.mix.rate();

        for frame in 0..self.frames {
            let value = self.signal.value(rate, self.position + frame as u64);
            for channel in 0..channels {
                let (plane, at) = if self.interleaved {
                    (0, (frame * channels + channel) * size)
                } else {
                    (channel, frame * size)
                };
                encode(sample, value, &mut self.input[plane][at..at + size]);
            }
        }
    }

    fn process(&mut self, xrun: bool) {
        let sample = self.format.mix.sample();

        self.generate_input();
        for plane in &mut self.output {
            fill_silence(sample, plane);
        }

        self.bump.reset();

        let Engine {
            callback,
            format,
            interleaved,
            frames,
            input,
            output,
            tap,
            bump,
            position,
            ..
        } = self;

        let input = match (input.is_empty(), *interleaved) {
            (true, _) => None,
            (false, true) => Some(NativeInput::Interleaved(&input[0][..])),
            (false, false) => Some(NativeInput::NonInterleaved(
                bump.alloc_slice_fill_iter(input.iter().map(|plane| &plane[..])),
            )),
        };

        let output = match (output.is_empty(), *interleaved) {
            (true, _) => None,
            (false, true) => Some(NativeOutput::Interleaved(&mut output[0][..])),
            (false, false) => Some(NativeOutput::NonInterleaved(
                bump.alloc_slice_fill_iter(output.iter_mut().map(|plane| &mut plane[..])),
            )),
        };

        let mut buffer = Buffer {
            frames: *frames,
            input,
            output,
            position: *position,
            time_valid: true,
            xrun,
        };

        callback.on_buffer(&mut buffer);

        if let (Some(tap), Some(output)) = (tap, &buffer.output) {
            tap.capture(output, sample, format.channels.outputs, *frames);
        }

        *position += *frames as u64;
    }

    fn run(mut self, name: &str, stop: &AtomicBool) -> Engine {
        let period = self.period();
        let mut deadline = Instant::now() + self.faults.start_delay + period;
        let mut periods = 0;

        while !stop.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
                continue;
            }

            // More than a period late: real hardware would have lost a buffer.
            let late = now - deadline > period;
            if late {
                tracing::trace!(device = name, periods, "period overrun");
                deadline = now;
            }

            let xrun = late || self.faults.xrun_periods.contains(&periods);
            self.process(xrun);
            periods += 1;

            if self.faults.fail_after == Some(periods) {
                tracing::debug!(device = name, periods, "injecting device failure");
                let error = Error::Failed(periods).into_core(self.system);
                self.callback.on_fatal(error);
                break;
            }

            deadline += period;
        }

        self
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Engine>,
}

/// A simulated stream. Each start spawns a period thread; each stop joins it.
pub(crate) struct SimStream {
    state: Arc<SimState>,
    device: usize,
    name: String,
    format: Format,
    frames: usize,
    engine: Option<Engine>,
    running: Option<Running>,
}

impl SimStream {
    pub(crate) fn new(
        state: Arc<SimState>,
        device: usize,
        desc: StreamDesc,
        signal: Signal,
        faults: FaultPlan,
        mut tap: Option<TapWriter>,
    ) -> SimStream {
        let StreamDesc {
            format,
            interleaved,
            frames,
            callback,
        } = desc;

        let size = format.mix.sample().size();
        let planes = |channels: usize| {
            if channels == 0 {
                Vec::new()
            } else if interleaved {
                vec![vec![0; frames * channels * size]]
            } else {
                vec![vec![0; frames * size]; channels]
            }
        };

        if let Some(tap) = &mut tap {
            tap.reserve(frames);
        }

        let channels = format.channels.inputs + format.channels.outputs;
        let engine = Engine {
            system: state.system(),
            callback,
            format,
            interleaved,
            frames,
            signal,
            faults,
            input: planes(format.channels.inputs),
            output: planes(format.channels.outputs),
            tap,
            bump: Bump::with_capacity(2 * channels * std::mem::size_of::<&mut [u8]>()),
            position: 0,
        };

        state.stream_opened();

        SimStream {
            name: state.device(device).name.clone(),
            state,
            device,
            format,
            frames,
            engine: Some(engine),
            running: None,
        }
    }

    fn spawn(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let engine = self.engine.take().ok_or(Error::ThreadCrashed)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let name = self.name.clone();
        let (err_sender, err_receiver) = oneshot::channel();

        let handle = std::thread::Builder::new()
            .name(format!("rxt-sim-{}", self.device))
            .spawn(move || {
                if engine.faults.refuse_start {
                    let _ = err_sender.send(Some(Error::StartRefused));
                    return engine;
                }

                if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max)
                {
                    tracing::debug!(device = %name, "failed to raise thread priority: {e:?}");
                }

                let _ = err_sender.send(None);
                engine.run(&name, &thread_stop)
            })
            .map_err(Error::ThreadSpawn)?;

        match err_receiver.recv() {
            Ok(None) => {}
            Ok(Some(err)) => {
                self.engine = handle.join().ok();
                return Err(err);
            }
            Err(_) => {
                self.engine = handle.join().ok();
                return Err(Error::ThreadCrashed);
            }
        }

        self.running = Some(Running { stop, handle });
        self.state.stream_started();
        tracing::debug!(device = %self.name, frames = self.frames, "simulated stream started");

        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.stop.store(true, Ordering::Release);
        self.state.stream_stopped();

        let engine = running.handle.join().map_err(|_| Error::ThreadCrashed)?;
        self.engine = Some(engine);

        tracing::debug!(device = %self.name, "simulated stream stopped");
        Ok(())
    }
}

impl DriverStream for SimStream {
    fn frames(&self) -> usize {
        self.frames
    }

    fn latency(&self) -> rxt_core::Result<Latency> {
        let period = self.format.frames_to_ms(self.frames);
        let channels = self.format.channels;

        Ok(Latency {
            input: if channels.inputs > 0 { period } else { 0.0 },
            output: if channels.outputs > 0 {
                2.0 * period
            } else {
                0.0
            },
        })
    }

    fn start(&mut self) -> rxt_core::Result<()> {
        self.spawn().map_err(|e| e.into_core(self.state.system()))
    }

    fn stop(&mut self) -> rxt_core::Result<()> {
        self.join().map_err(|e| e.into_core(self.state.system()))
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            tracing::warn!(device = %self.name, "failed to stop simulated stream: {e}");
        }

        if let Some(tap) = self.engine.as_mut().and_then(|engine| engine.tap.take()) {
            self.state.return_tap(self.device, tap);
        }

        self.state.stream_closed();
    }
}
