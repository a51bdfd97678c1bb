use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Sample encoding of a stream.
///
/// All types are native-endian except [`SampleType::I24`], which is packed little-endian into
/// three bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    U8,
    I8,
    I16,
    I24,
    I32,
    F32,
    F64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Attributes {
    /// Bytes per sample.
    pub size: usize,
    pub is_float: bool,
    pub is_signed: bool,
}

impl SampleType {
    pub const ALL: &'static [SampleType] = &[
        SampleType::U8,
        SampleType::I8,
        SampleType::I16,
        SampleType::I24,
        SampleType::I32,
        SampleType::F32,
        SampleType::F64,
    ];

    pub fn attributes(self) -> Attributes {
        let (size, is_float, is_signed) = match self {
            SampleType::U8 => (1, false, false),
            SampleType::I8 => (1, false, true),
            SampleType::I16 => (2, false, true),
            SampleType::I24 => (3, false, true),
            SampleType::I32 => (4, false, true),
            SampleType::F32 => (4, true, true),
            SampleType::F64 => (8, true, true),
        };

        Attributes {
            size,
            is_float,
            is_signed,
        }
    }

    pub fn size(self) -> usize {
        self.attributes().size
    }
}

/// Sample rate and sample type.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Mix {
    rate: u32,
    sample: SampleType,
}

impl Mix {
    pub fn new(rate: u32, sample: SampleType) -> Result<Mix> {
        let mix = Mix { rate, sample };
        mix.validate()?;
        Ok(mix)
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn sample(&self) -> SampleType {
        self.sample
    }

    /// Re-checks a mix that may have bypassed [`Mix::new`], e.g. through deserialization.
    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(Error::core(ErrorKind::InvalidFormat(
                "sample rate must be positive",
            )));
        }

        Ok(())
    }
}

/// Channel counts and masks for each direction.
///
/// Counts bound the buffer width presented to the callback. A mask routes among the device's
/// physical channels and is not required to agree with the count; a mask of 0 selects the first
/// `inputs`/`outputs` channels.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
pub struct Channels {
    pub inputs: usize,
    pub in_mask: u64,
    pub outputs: usize,
    pub out_mask: u64,
}

impl Channels {
    pub fn new(inputs: usize, in_mask: u64, outputs: usize, out_mask: u64) -> Channels {
        Channels {
            inputs,
            in_mask,
            outputs,
            out_mask,
        }
    }

    pub fn input(inputs: usize) -> Channels {
        Channels::new(inputs, 0, 0, 0)
    }

    pub fn output(outputs: usize) -> Channels {
        Channels::new(0, 0, outputs, 0)
    }

    pub fn duplex(inputs: usize, outputs: usize) -> Channels {
        Channels::new(inputs, 0, outputs, 0)
    }

    pub fn count(&self, output: bool) -> usize {
        if output {
            self.outputs
        } else {
            self.inputs
        }
    }
}

/// Complete description of a stream's sample layout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Format {
    pub mix: Mix,
    pub channels: Channels,
}

impl Format {
    pub fn new(mix: Mix, channels: Channels) -> Format {
        Format { mix, channels }
    }

    pub fn validate(&self) -> Result<()> {
        self.mix.validate()
    }

    pub fn has_channels(&self) -> bool {
        self.channels.inputs > 0 || self.channels.outputs > 0
    }

    /// Bytes per interleaved frame in one direction.
    pub fn frame_size(&self, output: bool) -> usize {
        self.channels.count(output) * self.mix.sample().size()
    }

    pub(crate) fn layout(&self, output: bool) -> crate::buffer::Layout {
        crate::buffer::Layout {
            channels: self.channels.count(output),
            sample_size: self.mix.sample().size(),
        }
    }

    /// Converts a frame count into milliseconds at this format's rate.
    pub fn frames_to_ms(&self, frames: usize) -> f64 {
        frames as f64 * 1000.0 / self.mix.rate() as f64
    }
}

/// Buffer size range a device accepts, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BufferSize {
    pub min: f64,
    pub max: f64,
    pub current: f64,
}

/// Stream latency per direction, in milliseconds. Zero when the direction is unused.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Latency {
    pub input: f64,
    pub output: f64,
}
