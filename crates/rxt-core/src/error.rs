use std::fmt;
use std::io;

use crate::format::SampleType;
use crate::system::System;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse origin of an error.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Cause {
    Format,
    Device,
    Buffer,
    Resource,
    Unknown,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cause::Format => "Format",
            Cause::Device => "Device",
            Cause::Buffer => "Buffer",
            Cause::Resource => "Resource",
            Cause::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// How a caller is expected to react to an error.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Category {
    /// Bad parameters. Fix them and retry.
    Configuration,
    /// The operation is not valid in the current state.
    State,
    /// The device went away or refused.
    Device,
    /// A resource could not be acquired, or the stream died.
    FatalResource,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("format not supported by device")]
    UnsupportedFormat,

    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),

    #[error("access mode not supported by device")]
    UnsupportedAccess,

    #[error("invalid buffer size {0} ms")]
    InvalidBufferSize(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("aggregate needs at least one device, got {0}")]
    DeviceCountMismatch(usize),

    #[error("a safe buffer is already registered for this stream")]
    AlreadyRegistered,

    #[error("no safe buffer registered for this stream")]
    NotRegistered,

    #[error("safe buffer is not locked")]
    NotLocked,

    #[error("safe buffer is already locked")]
    AlreadyLocked,

    #[error("safe buffer is still locked")]
    StillLocked,

    #[error("sample type mismatch: stream carries {expected:?}, requested {requested:?}")]
    SampleMismatch {
        expected: SampleType,
        requested: SampleType,
    },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("no device at index {0}")]
    DeviceNotFound(usize),

    #[error("device already has an open stream")]
    DeviceBusy,

    #[error("device disconnected")]
    DeviceLost,

    #[error("backend error {code}: {message}")]
    Backend { code: i32, message: String },

    #[error("failed to spawn thread")]
    ThreadSpawn(#[source] io::Error),

    #[error("thread crashed")]
    ThreadCrashed,
}

/// Flat identifier of an [`ErrorKind`], without payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Fault {
    UnsupportedFormat,
    InvalidFormat,
    UnsupportedAccess,
    InvalidBufferSize,
    InvalidConfiguration,
    DeviceCountMismatch,
    AlreadyRegistered,
    NotRegistered,
    NotLocked,
    AlreadyLocked,
    StillLocked,
    SampleMismatch,
    InvalidState,
    DeviceNotFound,
    DeviceBusy,
    DeviceLost,
    Backend,
    ThreadSpawn,
    ThreadCrashed,
}

#[rustfmt::skip]
const FAULTS: &[(Fault, u32, Cause, Category, &str)] = &[
    (Fault::UnsupportedFormat, 1, Cause::Format, Category::Configuration, "format not supported"),
    (Fault::InvalidFormat, 2, Cause::Format, Category::Configuration, "invalid format"),
    (Fault::UnsupportedAccess, 3, Cause::Format, Category::Configuration, "access mode not supported"),
    (Fault::InvalidBufferSize, 4, Cause::Buffer, Category::Configuration, "invalid buffer size"),
    (Fault::InvalidConfiguration, 5, Cause::Unknown, Category::Configuration, "invalid configuration"),
    (Fault::DeviceCountMismatch, 6, Cause::Device, Category::Configuration, "device count mismatch"),
    (Fault::AlreadyRegistered, 7, Cause::Buffer, Category::State, "already registered"),
    (Fault::NotRegistered, 8, Cause::Buffer, Category::State, "not registered"),
    (Fault::NotLocked, 9, Cause::Buffer, Category::State, "not locked"),
    (Fault::AlreadyLocked, 10, Cause::Buffer, Category::State, "already locked"),
    (Fault::StillLocked, 11, Cause::Buffer, Category::State, "still locked"),
    (Fault::SampleMismatch, 12, Cause::Format, Category::Configuration, "sample type mismatch"),
    (Fault::InvalidState, 13, Cause::Unknown, Category::State, "invalid state"),
    (Fault::DeviceNotFound, 14, Cause::Device, Category::Device, "device not found"),
    (Fault::DeviceBusy, 15, Cause::Device, Category::Device, "device busy"),
    (Fault::DeviceLost, 16, Cause::Device, Category::FatalResource, "device lost"),
    (Fault::Backend, 17, Cause::Unknown, Category::Device, "backend failure"),
    (Fault::ThreadSpawn, 18, Cause::Resource, Category::FatalResource, "thread spawn failed"),
    (Fault::ThreadCrashed, 19, Cause::Resource, Category::FatalResource, "thread crashed"),
];

impl Fault {
    fn entry(self) -> Option<&'static (Fault, u32, Cause, Category, &'static str)> {
        FAULTS.iter().find(|entry| entry.0 == self)
    }

    pub fn to_raw(self) -> u32 {
        self.entry().map_or(0, |entry| entry.1)
    }

    pub fn from_raw(raw: u32) -> Option<Fault> {
        FAULTS.iter().find(|entry| entry.1 == raw).map(|entry| entry.0)
    }

    pub fn cause(self) -> Cause {
        self.entry().map_or(Cause::Unknown, |entry| entry.2)
    }

    pub fn category(self) -> Category {
        self.entry().map_or(Category::FatalResource, |entry| entry.3)
    }

    pub fn description(self) -> &'static str {
        self.entry().map_or("unknown fault", |entry| entry.4)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ErrorKind {
    pub fn fault(&self) -> Fault {
        match self {
            ErrorKind::UnsupportedFormat => Fault::UnsupportedFormat,
            ErrorKind::InvalidFormat(_) => Fault::InvalidFormat,
            ErrorKind::UnsupportedAccess => Fault::UnsupportedAccess,
            ErrorKind::InvalidBufferSize(_) => Fault::InvalidBufferSize,
            ErrorKind::InvalidConfiguration(_) => Fault::InvalidConfiguration,
            ErrorKind::DeviceCountMismatch(_) => Fault::DeviceCountMismatch,
            ErrorKind::AlreadyRegistered => Fault::AlreadyRegistered,
            ErrorKind::NotRegistered => Fault::NotRegistered,
            ErrorKind::NotLocked => Fault::NotLocked,
            ErrorKind::AlreadyLocked => Fault::AlreadyLocked,
            ErrorKind::StillLocked => Fault::StillLocked,
            ErrorKind::SampleMismatch { .. } => Fault::SampleMismatch,
            ErrorKind::InvalidState { .. } => Fault::InvalidState,
            ErrorKind::DeviceNotFound(_) => Fault::DeviceNotFound,
            ErrorKind::DeviceBusy => Fault::DeviceBusy,
            ErrorKind::DeviceLost => Fault::DeviceLost,
            ErrorKind::Backend { .. } => Fault::Backend,
            ErrorKind::ThreadSpawn(_) => Fault::ThreadSpawn,
            ErrorKind::ThreadCrashed => Fault::ThreadCrashed,
        }
    }

    pub fn cause(&self) -> Cause {
        self.fault().cause()
    }

    pub fn category(&self) -> Category {
        self.fault().category()
    }

    /// Whether the error signals API misuse rather than an environmental failure.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self.fault(),
            Fault::AlreadyRegistered
                | Fault::NotRegistered
                | Fault::NotLocked
                | Fault::AlreadyLocked
                | Fault::StillLocked
                | Fault::InvalidState
                | Fault::SampleMismatch
        )
    }
}

/// An error tagged with the audio system it originated from.
///
/// Errors raised by the core itself (format validation, state checks) carry no system.
#[derive(Debug)]
pub struct Error {
    system: Option<System>,
    kind: ErrorKind,
}

impl Error {
    pub fn new(system: System, kind: ErrorKind) -> Error {
        Error {
            system: Some(system),
            kind,
        }
    }

    pub(crate) fn core(kind: ErrorKind) -> Error {
        Error { system: None, kind }
    }

    pub(crate) fn invalid_state(operation: &'static str, state: &'static str) -> Error {
        Error::core(ErrorKind::InvalidState { operation, state })
    }

    pub(crate) fn or_system(mut self, system: System) -> Error {
        self.system.get_or_insert(system);
        self
    }

    pub fn system(&self) -> Option<System> {
        self.system
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn fault(&self) -> Fault {
        self.kind.fault()
    }

    pub fn cause(&self) -> Cause {
        self.kind.cause()
    }

    pub fn category(&self) -> Category {
        self.kind.category()
    }

    pub fn is_contract_violation(&self) -> bool {
        self.kind.is_contract_violation()
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::new(self.system, self.fault())
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            system: self.system,
            cause: self.cause(),
            fault: self.fault(),
            text: self.kind.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.system {
            Some(system) => write!(f, "{system}: {}", self.kind),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

/// Packed error code: originating system id in the high 32 bits, fault in the low 32 bits.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ErrorCode(pub u64);

impl ErrorCode {
    pub fn new(system: Option<System>, fault: Fault) -> ErrorCode {
        let system = system.map_or(0, System::to_raw) as u64;
        ErrorCode(system << 32 | fault.to_raw() as u64)
    }

    pub fn system(self) -> Option<System> {
        System::from_raw((self.0 >> 32) as u32)
    }

    pub fn fault(self) -> Option<Fault> {
        Fault::from_raw(self.0 as u32)
    }

    pub fn decompose(self) -> (Cause, Option<Fault>, Option<System>) {
        let fault = self.fault();
        let cause = fault.map_or(Cause::Unknown, Fault::cause);
        (cause, fault, self.system())
    }
}

/// Human-readable breakdown of an error.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorInfo {
    pub system: Option<System>,
    pub cause: Cause,
    pub fault: Fault,
    pub text: String,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let system = self.system.map_or("Core", System::name);
        write!(
            f,
            "{system} {} Error: {} ({})",
            self.cause, self.fault, self.text
        )
    }
}

/// Describes a packed error code.
pub fn describe(code: ErrorCode) -> String {
    let (cause, fault, system) = code.decompose();
    let system = system.map_or("Core", System::name);
    match fault {
        Some(fault) => format!("{system} {cause} Error: {fault} ({})", fault.description()),
        None => format!("{system} {cause} Error: unknown fault {}", code.0 as u32),
    }
}
