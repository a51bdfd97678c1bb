use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::driver::{Backend, DeviceDriver};
use crate::error::{Error, ErrorKind, Result};
use crate::format::{BufferSize, Format, Mix};
use crate::platform::PlatformInner;
use crate::stream::{DeviceStreamParams, Stream};
use crate::system::{ServiceCaps, Setup, System};

/// One audio system, as registered with the platform.
#[derive(Clone)]
pub struct Service {
    platform: Arc<PlatformInner>,
    backend: Arc<dyn Backend>,
}

impl Service {
    pub(crate) fn new(platform: Arc<PlatformInner>, backend: Arc<dyn Backend>) -> Service {
        Service { platform, backend }
    }

    pub(crate) fn platform(&self) -> &Arc<PlatformInner> {
        &self.platform
    }

    pub fn system(&self) -> System {
        self.backend.system()
    }

    pub fn setup(&self) -> Setup {
        self.backend.setup()
    }

    pub fn capabilities(&self) -> ServiceCaps {
        self.backend.capabilities()
    }

    pub fn device_count(&self) -> Result<usize> {
        self.platform.check("count devices")?;
        self.backend
            .device_count()
            .map_err(|e| e.or_system(self.system()))
    }

    pub fn open_device(&self, index: usize) -> Result<Device> {
        self.platform.check("open device")?;

        let system = self.system();
        let count = self.device_count()?;
        if index >= count {
            return Err(Error::new(system, ErrorKind::DeviceNotFound(index)));
        }

        let driver = self
            .backend
            .open_device(index)
            .map_err(|e| e.or_system(system))?;

        tracing::debug!(%system, index, "opened device");
        Ok(Device::new(self.platform.clone(), system, index, driver))
    }

    /// Opens the default input or output device, if the system has one.
    pub fn open_default_device(&self, output: bool) -> Result<Option<Device>> {
        self.platform.check("open device")?;

        let index = self
            .backend
            .default_device(output)
            .map_err(|e| e.or_system(self.system()))?;

        index.map(|index| self.open_device(index)).transpose()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("system", &self.system())
            .finish_non_exhaustive()
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Identifies one opened device handle. Two handles to the same hardware have distinct ids.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DeviceId {
    pub system: System,
    pub index: usize,
    serial: u64,
}

pub(crate) struct DeviceShared {
    id: DeviceId,
    platform: Arc<PlatformInner>,
    driver: Box<dyn DeviceDriver>,
    busy: AtomicBool,
}

/// An opened device. Cheap to clone; clones share the same handle.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    fn new(
        platform: Arc<PlatformInner>,
        system: System,
        index: usize,
        driver: Box<dyn DeviceDriver>,
    ) -> Device {
        let id = DeviceId {
            system,
            index,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        };

        Device {
            shared: Arc::new(DeviceShared {
                id,
                platform,
                driver,
                busy: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.shared.id
    }

    pub fn system(&self) -> System {
        self.shared.id.system
    }

    pub(crate) fn platform(&self) -> &Arc<PlatformInner> {
        &self.shared.platform
    }

    pub(crate) fn driver(&self) -> &dyn DeviceDriver {
        &*self.shared.driver
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        self.shared.platform.check(operation)
    }

    fn tag<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| e.or_system(self.system()))
    }

    pub fn name(&self) -> Result<String> {
        self.check("query device")?;
        self.tag(self.driver().name())
    }

    pub fn channel_count(&self, output: bool) -> Result<usize> {
        self.check("query device")?;
        self.tag(self.driver().channel_count(output))
    }

    pub fn channel_name(&self, output: bool, index: usize) -> Result<String> {
        self.check("query device")?;
        self.tag(self.driver().channel_name(output, index))
    }

    /// The device's natural mix. `None` if it has no preferred one.
    pub fn mix(&self) -> Result<Option<Mix>> {
        self.check("query device")?;
        self.tag(self.driver().mix())
    }

    /// Whether the device accepts `format`. Invalid formats are simply unsupported.
    pub fn supports_format(&self, format: &Format) -> Result<bool> {
        self.check("query device")?;
        if format.validate().is_err() {
            return Ok(false);
        }

        self.tag(self.driver().supports_format(format))
    }

    pub fn supports_access(&self, interleaved: bool) -> Result<bool> {
        self.check("query device")?;
        self.tag(self.driver().supports_access(interleaved))
    }

    /// Buffer size range for `format`. Fails with `UnsupportedFormat` if the device rejects it.
    pub fn buffer_size(&self, format: &Format) -> Result<BufferSize> {
        if !self.supports_format(format)? {
            return Err(Error::new(self.system(), ErrorKind::UnsupportedFormat));
        }

        self.tag(self.driver().buffer_size(format))
    }

    /// Opens a stream on this device. Only one stream may be open per device handle.
    pub fn open_stream(&self, params: DeviceStreamParams) -> Result<Stream> {
        Stream::open(self, params, 0, None)
    }

    /// Marks the handle busy until the returned lease is dropped.
    pub(crate) fn lease(&self) -> Result<DeviceLease> {
        self.shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::new(self.system(), ErrorKind::DeviceBusy))?;

        Ok(DeviceLease {
            shared: self.shared.clone(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

pub(crate) struct DeviceLease {
    shared: Arc<DeviceShared>,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.shared.busy.store(false, Ordering::Release);
    }
}
