use std::io;

use rxt_core::{ErrorKind, System};

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to spawn thread")]
    ThreadSpawn(#[source] io::Error),

    #[error("thread crashed")]
    ThreadCrashed,

    #[error("no {direction} channel {index}")]
    NoSuchChannel {
        direction: &'static str,
        index: usize,
    },

    #[error("no device {0}")]
    NoSuchDevice(usize),

    #[error("device refused to start")]
    StartRefused,

    #[error("device failed after {0} periods")]
    Failed(u64),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn code(&self) -> i32 {
        match self {
            Error::ThreadSpawn(_) => 1,
            Error::ThreadCrashed => 2,
            Error::NoSuchChannel { .. } => 3,
            Error::NoSuchDevice(_) => 4,
            Error::StartRefused => 5,
            Error::Failed(_) => 6,
        }
    }

    /// Converts into a core error tagged with the simulated system.
    pub fn into_core(self, system: System) -> rxt_core::Error {
        let kind = match self {
            Error::ThreadSpawn(e) => ErrorKind::ThreadSpawn(e),
            Error::ThreadCrashed => ErrorKind::ThreadCrashed,
            Error::NoSuchDevice(index) => ErrorKind::DeviceNotFound(index),
            Error::Failed(_) => ErrorKind::DeviceLost,
            other => ErrorKind::Backend {
                code: other.code(),
                message: other.to_string(),
            },
        };

        rxt_core::Error::new(system, kind)
    }
}
