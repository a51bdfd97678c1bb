use std::time::Duration;

use rxt_core::{BufferSize, Mix, SampleType, ServiceCaps, Setup, System};
use serde::{Deserialize, Serialize};

use crate::signal::Signal;

/// A simulated audio system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// The system this backend reports itself as.
    pub system: System,
    pub setup: Setup,
    pub capabilities: ServiceCaps,
    pub devices: Vec<SimDeviceConfig>,
    pub default_input: Option<usize>,
    pub default_output: Option<usize>,
}

impl SimConfig {
    /// A system with the given devices. Defaults point at the first device of each direction.
    pub fn with_devices(devices: Vec<SimDeviceConfig>) -> SimConfig {
        let default_input = devices.iter().position(|d| d.inputs > 0);
        let default_output = devices.iter().position(|d| d.outputs > 0);

        SimConfig {
            devices,
            default_input,
            default_output,
            ..SimConfig::default()
        }
    }
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig {
            system: System::Simulated,
            setup: Setup::ProAudio,
            capabilities: ServiceCaps::TIME
                | ServiceCaps::LATENCY
                | ServiceCaps::FULL_DUPLEX
                | ServiceCaps::XRUN_DETECTION
                | ServiceCaps::AGGREGATION,
            devices: Vec::new(),
            default_input: None,
            default_output: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    pub name: String,
    pub inputs: usize,
    pub outputs: usize,
    pub rates: Vec<u32>,
    pub samples: Vec<SampleType>,
    /// Natural mix, if the device has one.
    pub mix: Option<Mix>,
    pub interleaved: bool,
    pub non_interleaved: bool,
    pub buffer_size: BufferSize,
    /// What the device captures on its inputs.
    pub signal: Signal,
    pub faults: FaultPlan,
}

impl SimDeviceConfig {
    pub fn new(name: impl Into<String>, inputs: usize, outputs: usize) -> SimDeviceConfig {
        SimDeviceConfig {
            name: name.into(),
            inputs,
            outputs,
            ..SimDeviceConfig::default()
        }
    }
}

impl Default for SimDeviceConfig {
    fn default() -> SimDeviceConfig {
        SimDeviceConfig {
            name: "Simulated Device".into(),
            inputs: 2,
            outputs: 2,
            rates: vec![44100, 48000, 96000],
            samples: SampleType::ALL.to_vec(),
            mix: Mix::new(48000, SampleType::F32).ok(),
            interleaved: true,
            non_interleaved: true,
            buffer_size: BufferSize {
                min: 1.0,
                max: 100.0,
                current: 10.0,
            },
            signal: Signal::Silence,
            faults: FaultPlan::default(),
        }
    }
}

/// Misbehavior injected into a simulated device's streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultPlan {
    /// Extra delay before the first period after each start.
    pub start_delay: Duration,
    /// Periods (counted from 0 after each start) flagged as x-runs.
    pub xrun_periods: Vec<u64>,
    /// Fail with a lost device after this many periods.
    pub fail_after: Option<u64>,
    /// Refuse to start.
    pub refuse_start: bool,
}
