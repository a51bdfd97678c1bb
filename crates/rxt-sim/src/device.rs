use std::sync::Arc;

use rxt_core::driver::{DeviceDriver, DriverStream, StreamDesc};
use rxt_core::{BufferSize, Format, Mix, Result};

use crate::config::SimDeviceConfig;
use crate::stream::SimStream;
use crate::{Error, SimState};

pub(crate) struct SimDevice {
    index: usize,
    state: Arc<SimState>,
}

impl SimDevice {
    pub(crate) fn new(index: usize, state: Arc<SimState>) -> SimDevice {
        SimDevice { index, state }
    }

    fn config(&self) -> &SimDeviceConfig {
        self.state.device(self.index)
    }
}

impl DeviceDriver for SimDevice {
    fn name(&self) -> Result<String> {
        Ok(self.config().name.clone())
    }

    fn mix(&self) -> Result<Option<Mix>> {
        Ok(self.config().mix)
    }

    fn channel_count(&self, output: bool) -> Result<usize> {
        let config = self.config();
        Ok(if output { config.outputs } else { config.inputs })
    }

    fn channel_name(&self, output: bool, index: usize) -> Result<String> {
        let direction = if output { "output" } else { "input" };
        if index >= self.channel_count(output)? {
            return Err(Error::NoSuchChannel { direction, index }.into_core(self.state.system()));
        }

        let label = if output { "Out" } else { "In" };
        Ok(format!("{} {label} {}", self.config().name, index + 1))
    }

    fn supports_format(&self, format: &Format) -> Result<bool> {
        let config = self.config();
        let channels = format.channels;

        Ok(config.rates.contains(&format.mix.rate())
            && config.samples.contains(&format.mix.sample())
            && channels.inputs <= config.inputs
            && channels.outputs <= config.outputs)
    }

    fn supports_access(&self, interleaved: bool) -> Result<bool> {
        let config = self.config();
        Ok(if interleaved {
            config.interleaved
        } else {
            config.non_interleaved
        })
    }

    fn buffer_size(&self, _format: &Format) -> Result<BufferSize> {
        Ok(self.config().buffer_size)
    }

    fn open_stream(&self, desc: StreamDesc) -> Result<Box<dyn DriverStream>> {
        let config = self.config();
        let tap = self.state.take_tap(self.index);

        tracing::debug!(
            device = %config.name,
            frames = desc.frames,
            interleaved = desc.interleaved,
            tapped = tap.is_some(),
            "opening simulated stream"
        );

        Ok(Box::new(SimStream::new(
            self.state.clone(),
            self.index,
            desc,
            config.signal,
            config.faults.clone(),
            tap,
        )))
    }
}
