use rxt_core::buffer::NativeOutput;
use rxt_core::sample::{decode, encode};
use rxt_core::sync::ring::{self, Consumer, Producer};
use rxt_core::SampleType;

const F64_SIZE: usize = 8;

/// Captures what a simulated device plays on its outputs.
///
/// Frames are interleaved over all of the device's output channels and decoded to `f64`. Channels
/// not covered by the stream's format read as zero. Frames that don't fit are dropped.
pub struct Tap {
    consumer: Consumer,
    channels: usize,
}

impl Tap {
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames waiting to be read.
    pub fn available(&self) -> usize {
        self.consumer.len()
    }

    /// Drains every captured frame.
    pub fn read(&mut self) -> Vec<f64> {
        let mut bytes = vec![0; self.consumer.len() * self.channels * F64_SIZE];
        let frames = self.consumer.read(&mut bytes);

        bytes[..frames * self.channels * F64_SIZE]
            .chunks_exact(F64_SIZE)
            .map(|bytes| decode(SampleType::F64, bytes))
            .collect()
    }
}

pub(crate) struct TapWriter {
    producer: Producer,
    channels: usize,
    staging: Vec<u8>,
}

pub(crate) fn tap(channels: usize, frames: usize) -> (TapWriter, Tap) {
    let frame_size = channels.max(1) * F64_SIZE;
    let (producer, consumer) = ring::ring(frames, frame_size);

    let writer = TapWriter {
        producer,
        channels,
        staging: Vec::new(),
    };

    (writer, Tap { consumer, channels })
}

impl TapWriter {
    /// Preallocates staging for periods of up to `frames` frames.
    pub fn reserve(&mut self, frames: usize) {
        let len = frames * self.channels * F64_SIZE;
        if self.staging.len() < len {
            self.staging.resize(len, 0);
        }
    }

    pub fn capture(
        &mut self,
        output: &NativeOutput<'_>,
        sample: SampleType,
        channels: usize,
        frames: usize,
    ) {
        if self.channels == 0 {
            return;
        }

        let size = sample.size();
        let len = frames * self.channels * F64_SIZE;
        if self.staging.len() < len {
            return;
        }

        for frame in 0..frames {
            for channel in 0..self.channels {
                let value = if channel < channels {
                    let bytes = match output {
                        NativeOutput::Interleaved(data) => {
                            let at = (frame * channels + channel) * size;
                            &data[at..at + size]
                        }
                        NativeOutput::NonInterleaved(planes) => {
                            &planes[channel][frame * size..(frame + 1) * size]
                        }
                    };
                    decode(sample, bytes)
                } else {
                    0.0
                };

                let at = (frame * self.channels + channel) * F64_SIZE;
                encode(SampleType::F64, value, &mut self.staging[at..at + F64_SIZE]);
            }
        }

        let written = self.producer.write(&self.staging[..len]);
        if written < frames {
            tracing::trace!(dropped = frames - written, "tap overflow");
        }
    }
}
