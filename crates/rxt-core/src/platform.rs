use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::driver::Backend;
use crate::error::{Error, Result};
use crate::service::Service;
use crate::system::{Setup, System};

static CURRENT: Mutex<Weak<PlatformInner>> = Mutex::new(Weak::new());

pub(crate) struct PlatformInner {
    id: String,
    backends: Vec<Arc<dyn Backend>>,
    terminated: AtomicBool,
    live_streams: AtomicUsize,
}

impl PlatformInner {
    /// Fails once the platform has been terminated.
    pub(crate) fn check(&self, operation: &'static str) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::invalid_state(operation, "platform is terminated"));
        }

        Ok(())
    }

    pub(crate) fn stream_opened(&self) {
        self.live_streams.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stream_closed(&self) {
        self.live_streams.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct PlatformBuilder {
    id: String,
    backends: Vec<Arc<dyn Backend>>,
}

impl PlatformBuilder {
    /// Application identifier, passed on to systems that display one.
    pub fn id(mut self, id: impl Into<String>) -> PlatformBuilder {
        self.id = id.into();
        self
    }

    pub fn backend(mut self, backend: impl Backend) -> PlatformBuilder {
        self.backends.push(Arc::new(backend));
        self
    }

    /// Initializes the process-wide platform.
    ///
    /// If a live platform already exists it is returned unchanged, and this builder is discarded.
    pub fn init(self) -> Platform {
        let mut current = CURRENT.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(inner) = current.upgrade() {
            if !inner.terminated.load(Ordering::Acquire) {
                tracing::debug!(id = %inner.id, "platform already initialized");
                return Platform { inner };
            }
        }

        let platform = self.build();
        *current = Arc::downgrade(&platform.inner);
        platform
    }

    /// Creates a platform that is not registered process-wide.
    pub fn build(self) -> Platform {
        let systems: Vec<_> = self.backends.iter().map(|b| b.system()).collect();
        tracing::debug!(id = %self.id, ?systems, "platform initialized");

        Platform {
            inner: Arc::new(PlatformInner {
                id: self.id,
                backends: self.backends,
                terminated: AtomicBool::new(false),
                live_streams: AtomicUsize::new(0),
            }),
        }
    }
}

/// Entry point: owns the registered backends.
#[derive(Clone)]
pub struct Platform {
    inner: Arc<PlatformInner>,
}

impl Platform {
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder {
            id: String::new(),
            backends: Vec::new(),
        }
    }

    /// The process-wide platform, if one is initialized and not terminated.
    pub fn current() -> Option<Platform> {
        let current = CURRENT.lock().unwrap_or_else(PoisonError::into_inner);
        current
            .upgrade()
            .filter(|inner| !inner.terminated.load(Ordering::Acquire))
            .map(|inner| Platform { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    /// Registered systems, in registration order.
    pub fn systems(&self) -> Vec<System> {
        self.inner.backends.iter().map(|b| b.system()).collect()
    }

    /// The first registered system offering `setup`.
    pub fn setup_to_system(&self, setup: Setup) -> Option<System> {
        self.inner
            .backends
            .iter()
            .find(|b| b.setup() == setup)
            .map(|b| b.system())
    }

    pub fn service(&self, system: System) -> Result<Option<Service>> {
        self.inner.check("open service")?;

        let backend = self.inner.backends.iter().find(|b| b.system() == system);
        Ok(backend.map(|backend| Service::new(self.inner.clone(), backend.clone())))
    }

    /// Tears the platform down. Every service, device and stream obtained from it fails
    /// afterwards.
    ///
    /// Fails while streams are still open, or if already terminated.
    pub fn terminate(&self) -> Result<()> {
        self.inner.check("terminate")?;

        let streams = self.inner.live_streams.load(Ordering::Acquire);
        if streams > 0 {
            return Err(Error::invalid_state("terminate", "streams are open"));
        }

        self.inner.terminated.store(true, Ordering::Release);

        let mut current = CURRENT.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ptr() == Arc::as_ptr(&self.inner) {
            *current = Weak::new();
        }

        tracing::debug!(id = %self.inner.id, "platform terminated");
        Ok(())
    }
}
