mod aggregate;
pub mod buffer;
pub mod driver;
mod error;
mod format;
mod platform;
pub mod sample;
mod safe_buffer;
mod service;
mod stream;
pub mod sync;
mod system;

pub use self::aggregate::{AggregateDeviceParams, AggregateParams, DriftPolicy};
pub use self::error::{
    describe, Category, Cause, Error, ErrorCode, ErrorInfo, ErrorKind, Fault, Result,
};
pub use self::format::{Attributes, BufferSize, Channels, Format, Latency, Mix, SampleType};
pub use self::platform::{Platform, PlatformBuilder};
pub use self::safe_buffer::{InputView, OutputView, SafeAccess, SafeBuffer};
pub use self::sample::{Sample, I24};
pub use self::service::{Device, DeviceId, Service};
pub use self::stream::{
    BufferCallback, Callback, DeviceStreamParams, Stream, StreamParams, StreamState,
    XRunCallback,
};
pub use self::system::{version, ServiceCaps, Setup, System, Version};
