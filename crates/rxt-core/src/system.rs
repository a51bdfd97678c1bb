use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// An audio system a backend talks to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[non_exhaustive]
pub enum System {
    Alsa,
    Asio,
    Jack,
    PulseAudio,
    DirectSound,
    Wasapi,
    CoreAudio,
    Simulated,
}

const SYSTEM_IDS: &[(System, u32, &str)] = &[
    (System::Alsa, 1, "ALSA"),
    (System::Asio, 2, "ASIO"),
    (System::Jack, 3, "JACK"),
    (System::PulseAudio, 4, "PulseAudio"),
    (System::DirectSound, 5, "DirectSound"),
    (System::Wasapi, 6, "WASAPI"),
    (System::CoreAudio, 7, "CoreAudio"),
    (System::Simulated, 8, "Simulated"),
];

impl System {
    pub const ALL: &'static [System] = &[
        System::Alsa,
        System::Asio,
        System::Jack,
        System::PulseAudio,
        System::DirectSound,
        System::Wasapi,
        System::CoreAudio,
        System::Simulated,
    ];

    /// Stable numeric identifier, used in packed error codes. Never zero.
    pub fn to_raw(self) -> u32 {
        SYSTEM_IDS
            .iter()
            .find(|(system, _, _)| *system == self)
            .map_or(0, |(_, id, _)| *id)
    }

    pub fn from_raw(raw: u32) -> Option<System> {
        SYSTEM_IDS
            .iter()
            .find(|(_, id, _)| *id == raw)
            .map(|(system, _, _)| *system)
    }

    pub fn name(self) -> &'static str {
        SYSTEM_IDS
            .iter()
            .find(|(system, _, _)| *system == self)
            .map_or("Unknown", |(_, _, name)| name)
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The kind of audio setup an application asks for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Setup {
    ProAudio,
    SystemAudio,
    ConsumerAudio,
}

/// Features a service supports.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceCaps(u32);

impl ServiceCaps {
    /// Buffers carry a valid stream position.
    pub const TIME: ServiceCaps = ServiceCaps(1 << 0);
    /// Streams report latency.
    pub const LATENCY: ServiceCaps = ServiceCaps(1 << 1);
    /// A single device stream may carry both input and output.
    pub const FULL_DUPLEX: ServiceCaps = ServiceCaps(1 << 2);
    /// Channel masks select individual device channels.
    pub const CHANNEL_MASK: ServiceCaps = ServiceCaps(1 << 3);
    /// The system reports over- and underruns.
    pub const XRUN_DETECTION: ServiceCaps = ServiceCaps(1 << 4);
    /// Devices of this service may be combined into an aggregate stream.
    pub const AGGREGATION: ServiceCaps = ServiceCaps(1 << 5);

    pub const fn empty() -> ServiceCaps {
        ServiceCaps(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: ServiceCaps) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ServiceCaps {
    type Output = ServiceCaps;

    fn bitor(self, rhs: ServiceCaps) -> ServiceCaps {
        ServiceCaps(self.0 | rhs.0)
    }
}

impl BitOrAssign for ServiceCaps {
    fn bitor_assign(&mut self, rhs: ServiceCaps) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ServiceCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }

        let names = [
            (ServiceCaps::TIME, "Time"),
            (ServiceCaps::LATENCY, "Latency"),
            (ServiceCaps::FULL_DUPLEX, "FullDuplex"),
            (ServiceCaps::CHANNEL_MASK, "ChannelMask"),
            (ServiceCaps::XRUN_DETECTION, "XRunDetection"),
            (ServiceCaps::AGGREGATION, "Aggregation"),
        ];

        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Library version.
pub fn version() -> Version {
    Version {
        major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
    }
}
