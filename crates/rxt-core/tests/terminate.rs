use rxt_core::driver::{Backend, DeviceDriver};
use rxt_core::{Category, Error, ErrorKind, Platform, Result, ServiceCaps, Setup, System};

struct Empty(System, Setup);

impl Backend for Empty {
    fn system(&self) -> System {
        self.0
    }

    fn setup(&self) -> Setup {
        self.1
    }

    fn capabilities(&self) -> ServiceCaps {
        ServiceCaps::TIME
    }

    fn device_count(&self) -> Result<usize> {
        Ok(0)
    }

    fn default_device(&self, _output: bool) -> Result<Option<usize>> {
        Ok(None)
    }

    fn open_device(&self, index: usize) -> Result<Box<dyn DeviceDriver>> {
        Err(Error::new(self.0, ErrorKind::DeviceNotFound(index)))
    }
}

// The process-wide platform is shared by every test in this binary, so all checks involving it
// live in one test.
#[test]
fn process_wide_lifecycle() {
    let first = Platform::builder()
        .id("first")
        .backend(Empty(System::Simulated, Setup::ProAudio))
        .init();
    let second = Platform::builder().id("second").init();

    assert_eq!(second.id(), "first");
    assert_eq!(second.systems(), vec![System::Simulated]);
    assert_eq!(Platform::current().map(|p| p.id().to_owned()).as_deref(), Some("first"));

    first.terminate().unwrap();
    assert!(second.is_terminated());
    assert!(Platform::current().is_none());

    let third = Platform::builder().id("third").init();
    assert_eq!(third.id(), "third");
    third.terminate().unwrap();
}

#[test]
fn terminated_platform_rejects_everything() {
    let platform = Platform::builder()
        .backend(Empty(System::Alsa, Setup::SystemAudio))
        .build();

    let service = platform.service(System::Alsa).unwrap().unwrap();
    assert_eq!(service.device_count().unwrap(), 0);
    assert!(service.open_default_device(true).unwrap().is_none());

    platform.terminate().unwrap();

    let error = platform.service(System::Alsa).unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::InvalidState { .. }));
    assert_eq!(error.category(), Category::State);
    assert!(error.is_contract_violation());

    assert!(service.device_count().is_err());
    assert!(platform.terminate().is_err());
}

#[test]
fn service_lookup() {
    let platform = Platform::builder()
        .backend(Empty(System::Jack, Setup::ProAudio))
        .backend(Empty(System::PulseAudio, Setup::ConsumerAudio))
        .build();

    assert_eq!(platform.systems(), vec![System::Jack, System::PulseAudio]);
    assert_eq!(platform.setup_to_system(Setup::ConsumerAudio), Some(System::PulseAudio));
    assert_eq!(platform.setup_to_system(Setup::SystemAudio), None);
    assert!(platform.service(System::Wasapi).unwrap().is_none());

    let service = platform.service(System::Jack).unwrap().unwrap();
    let error = service.open_device(0).unwrap_err();
    assert_eq!(error.system(), Some(System::Jack));
    assert!(matches!(error.kind(), ErrorKind::DeviceNotFound(0)));
}
