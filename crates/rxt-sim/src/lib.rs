//! A software audio system.
//!
//! Devices are described by a [`SimConfig`]. Every running stream gets its own period thread that
//! wakes on absolute deadlines, fills inputs from the device's [`Signal`], calls the stream
//! callback and hands the outputs to a [`Tap`], if one is attached.

mod config;
mod device;
mod error;
mod signal;
mod stream;
mod tap;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rxt_core::driver::{Backend, DeviceDriver};
use rxt_core::{ServiceCaps, Setup, System};

pub use self::config::{FaultPlan, SimConfig, SimDeviceConfig};
use self::device::SimDevice;
pub use self::error::{Error, Result};
pub use self::signal::Signal;
pub use self::tap::Tap;
use self::tap::TapWriter;

pub(crate) struct SimState {
    config: SimConfig,
    open_streams: AtomicUsize,
    running_streams: AtomicUsize,
    taps: Mutex<Vec<Option<TapWriter>>>,
}

impl SimState {
    pub(crate) fn system(&self) -> System {
        self.config.system
    }

    /// Callers only pass indices validated against the device count.
    pub(crate) fn device(&self, index: usize) -> &SimDeviceConfig {
        &self.config.devices[index]
    }

    pub(crate) fn take_tap(&self, device: usize) -> Option<TapWriter> {
        let mut taps = self.taps.lock().unwrap_or_else(PoisonError::into_inner);
        taps.get_mut(device).and_then(Option::take)
    }

    pub(crate) fn return_tap(&self, device: usize, tap: TapWriter) {
        let mut taps = self.taps.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = taps.get_mut(device) {
            slot.get_or_insert(tap);
        }
    }

    pub(crate) fn stream_opened(&self) {
        self.open_streams.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stream_closed(&self) {
        self.open_streams.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn stream_started(&self) {
        self.running_streams.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stream_stopped(&self) {
        self.running_streams.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The simulated backend. Clones share devices, taps and counters, so a test can keep a handle
/// after registering the backend with a platform.
#[derive(Clone)]
pub struct SimBackend {
    state: Arc<SimState>,
}

impl SimBackend {
    pub fn new(config: SimConfig) -> SimBackend {
        let taps = config.devices.iter().map(|_| None).collect();

        SimBackend {
            state: Arc::new(SimState {
                config,
                open_streams: AtomicUsize::new(0),
                running_streams: AtomicUsize::new(0),
                taps: Mutex::new(taps),
            }),
        }
    }

    /// A small studio: a stereo interface, a microphone and a pair of speakers.
    pub fn demo() -> SimBackend {
        let speakers = SimDeviceConfig {
            non_interleaved: false,
            ..SimDeviceConfig::new("Speakers", 0, 2)
        };

        let microphone = SimDeviceConfig {
            signal: Signal::Sine {
                frequency: 440.0,
                amplitude: 0.5,
            },
            ..SimDeviceConfig::new("Microphone", 1, 0)
        };

        SimBackend::new(SimConfig::with_devices(vec![
            SimDeviceConfig::new("Studio Interface", 2, 2),
            microphone,
            speakers,
        ]))
    }

    pub fn config(&self) -> &SimConfig {
        &self.state.config
    }

    /// Attaches a capture tap holding up to `frames` frames to a device's outputs.
    ///
    /// The tap sees streams opened after this call. A previous tap on the device is replaced.
    pub fn tap(&self, device: usize, frames: usize) -> Result<Tap> {
        let config = self
            .state
            .config
            .devices
            .get(device)
            .ok_or(Error::NoSuchDevice(device))?;

        let (writer, tap) = tap::tap(config.outputs, frames);

        let mut taps = self.state.taps.lock().unwrap_or_else(PoisonError::into_inner);
        taps[device] = Some(writer);

        Ok(tap)
    }

    /// Streams opened on this backend and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.state.open_streams.load(Ordering::Acquire)
    }

    /// Streams with a live period thread.
    pub fn running_streams(&self) -> usize {
        self.state.running_streams.load(Ordering::Acquire)
    }
}

impl Backend for SimBackend {
    fn system(&self) -> System {
        self.state.config.system
    }

    fn setup(&self) -> Setup {
        self.state.config.setup
    }

    fn capabilities(&self) -> ServiceCaps {
        self.state.config.capabilities
    }

    fn device_count(&self) -> rxt_core::Result<usize> {
        Ok(self.state.config.devices.len())
    }

    fn default_device(&self, output: bool) -> rxt_core::Result<Option<usize>> {
        let config = &self.state.config;
        Ok(if output {
            config.default_output
        } else {
            config.default_input
        })
    }

    fn open_device(&self, index: usize) -> rxt_core::Result<Box<dyn DeviceDriver>> {
        if index >= self.state.config.devices.len() {
            return Err(Error::NoSuchDevice(index).into_core(self.system()));
        }

        Ok(Box::new(SimDevice::new(index, self.state.clone())))
    }
}
