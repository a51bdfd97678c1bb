use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rxt_core::buffer::{NativeInput, NativeOutput};
use rxt_core::{
    Callback, Category, Channels, DeviceStreamParams, ErrorKind, Fault, Format, Mix, Platform,
    Result, SafeBuffer, SampleType, Service, StreamParams, StreamState, System,
};
use rxt_sim::{FaultPlan, Signal, SimBackend, SimConfig, SimDeviceConfig};

fn setup(devices: Vec<SimDeviceConfig>) -> (Platform, SimBackend, Service) {
    let backend = SimBackend::new(SimConfig::with_devices(devices));
    let platform = Platform::builder()
        .id("streams")
        .backend(backend.clone())
        .build();
    let service = platform.service(System::Simulated).unwrap().unwrap();
    (platform, backend, service)
}

fn format(rate: u32, inputs: usize, outputs: usize) -> Format {
    Format::new(
        Mix::new(rate, SampleType::F32).unwrap(),
        Channels::duplex(inputs, outputs),
    )
}

fn params(format: Format, buffer_size: f64, stream: StreamParams) -> DeviceStreamParams {
    DeviceStreamParams {
        stream,
        format,
        buffer_size,
    }
}

fn idle() -> StreamParams {
    StreamParams::new(true, |_: &mut Callback<'_, '_>| {})
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn sine_reaches_the_output() {
    let device = SimDeviceConfig {
        rates: vec![44100],
        ..SimDeviceConfig::new("Out", 0, 1)
    };
    let (_platform, backend, service) = setup(vec![device]);
    let mut tap = backend.tap(0, 1 << 16).unwrap();
    let device = service.open_device(0).unwrap();

    let mut phase = 0u64;
    let on_buffer = move |cb: &mut Callback<'_, '_>| {
        let frames = cb.frames();
        if let Some(NativeOutput::Interleaved(out)) = &mut cb.buffer_mut().output {
            for (i, bytes) in out.chunks_exact_mut(4).take(frames).enumerate() {
                let t = (phase + i as u64) as f64 / 44100.0;
                let value = (TAU * 440.0 * t).sin() as f32;
                bytes.copy_from_slice(&value.to_ne_bytes());
            }
        }
        phase += frames as u64;
    };

    let mut stream = device
        .open_stream(params(
            format(44100, 0, 1),
            512.0 * 1000.0 / 44100.0,
            StreamParams::new(true, on_buffer),
        ))
        .unwrap();
    assert_eq!(stream.frames(), 512);

    stream.start().unwrap();

    let mut samples = Vec::new();
    let collected = wait_until(Duration::from_secs(10), || {
        samples.extend(tap.read());
        samples.len() >= 44100
    });
    stream.destroy().unwrap();
    assert!(collected);

    let crossings = samples[..44100]
        .windows(2)
        .filter(|pair| (pair[0] < 0.0) != (pair[1] < 0.0))
        .count();
    assert!((879..=881).contains(&crossings), "{crossings} zero crossings");
}

#[test]
fn destroy_releases_the_device() {
    let (_platform, backend, service) = setup(vec![SimDeviceConfig::new("Duplex", 2, 2)]);
    let device = service.open_device(0).unwrap();
    let format = format(48000, 2, 2);

    let probe = |device: &rxt_core::Device| {
        (
            device.name().unwrap(),
            device.channel_count(false).unwrap(),
            device.channel_count(true).unwrap(),
            device.supports_format(&format).unwrap(),
            device.buffer_size(&format).unwrap(),
        )
    };
    let before = probe(&device);

    let stream = device.open_stream(params(format, 10.0, idle())).unwrap();
    assert!(device.is_busy());
    assert_eq!(backend.open_streams(), 1);

    let error = device
        .open_stream(params(format, 10.0, idle()))
        .unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::DeviceBusy));
    assert_eq!(error.system(), Some(System::Simulated));
    assert_eq!(backend.open_streams(), 1);

    stream.destroy().unwrap();
    assert!(!device.is_busy());
    assert_eq!(backend.open_streams(), 0);
    assert_eq!(probe(&device), before);

    let stream = device.open_stream(params(format, 10.0, idle())).unwrap();
    drop(stream);
    assert_eq!(backend.open_streams(), 0);
}

#[test]
fn start_stop_state_machine() {
    let (_platform, backend, service) = setup(vec![SimDeviceConfig::new("Duplex", 2, 2)]);
    let device = service.open_device(0).unwrap();

    let periods = Arc::new(AtomicUsize::new(0));
    let counter = periods.clone();
    let stream = StreamParams::new(true, move |_: &mut Callback<'_, '_>| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    let mut stream = device
        .open_stream(params(format(48000, 2, 2), 5.0, stream))
        .unwrap();

    assert_eq!(stream.state(), StreamState::Created);
    stream.stop().unwrap();
    assert_eq!(stream.state(), StreamState::Created);

    stream.start().unwrap();
    assert!(stream.is_running());
    assert_eq!(backend.running_streams(), 1);

    let error = stream.start().unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::InvalidState { .. }));
    assert_eq!(error.category(), Category::State);

    assert!(wait_until(Duration::from_secs(5), || {
        periods.load(Ordering::Relaxed) >= 3
    }));

    stream.stop().unwrap();
    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(backend.running_streams(), 0);

    let stopped_at = periods.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(periods.load(Ordering::Relaxed), stopped_at);

    stream.stop().unwrap();

    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        periods.load(Ordering::Relaxed) > stopped_at
    }));
    stream.destroy().unwrap();
    assert_eq!(backend.running_streams(), 0);
    assert_eq!(backend.open_streams(), 0);
}

#[test]
fn latency_follows_frames() {
    let (_platform, _backend, service) = setup(vec![SimDeviceConfig::new("Duplex", 2, 2)]);
    let device = service.open_device(0).unwrap();

    let stream = device
        .open_stream(params(format(48000, 1, 2), 10.0, idle()))
        .unwrap();
    assert_eq!(stream.frames(), 480);

    let latency = stream.latency().unwrap();
    assert!((latency.input - 10.0).abs() < 1e-9);
    assert!((latency.output - 20.0).abs() < 1e-9);
}

#[test]
fn invalid_requests_are_rejected() {
    let (_platform, backend, service) = setup(vec![SimDeviceConfig::new("Duplex", 2, 2)]);
    let device = service.open_device(0).unwrap();

    let kind = |format: Format, buffer_size: f64| {
        device
            .open_stream(params(format, buffer_size, idle()))
            .unwrap_err()
            .kind()
            .fault()
    };

    assert_eq!(kind(format(48000, 0, 0), 10.0), Fault::InvalidFormat);
    assert_eq!(kind(format(48000, 3, 0), 10.0), Fault::UnsupportedFormat);
    assert_eq!(kind(format(22050, 1, 0), 10.0), Fault::UnsupportedFormat);
    assert_eq!(kind(format(48000, 1, 0), 0.0), Fault::InvalidBufferSize);
    assert_eq!(kind(format(48000, 1, 0), f64::NAN), Fault::InvalidBufferSize);

    assert!(!device.is_busy());
    assert_eq!(backend.open_streams(), 0);

    assert!(service.open_device(1).is_err());
    assert!(device.channel_name(false, 2).is_err());
    assert_eq!(device.channel_name(true, 1).unwrap(), "Duplex Out 2");
}

#[test]
fn safe_buffer_registration() {
    let (_platform, _backend, service) = setup(vec![SimDeviceConfig::new("Duplex", 2, 2)]);
    let device = service.open_device(0).unwrap();
    let stream = device
        .open_stream(params(format(48000, 2, 2), 10.0, idle()))
        .unwrap();

    let mut safe = SafeBuffer::register(&stream, false).unwrap();
    let error = SafeBuffer::register(&stream, true).unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::AlreadyRegistered));
    assert!(error.is_contract_violation());

    safe.unregister().unwrap();
    assert!(matches!(
        safe.unregister().unwrap_err().kind(),
        ErrorKind::NotRegistered
    ));

    let again = SafeBuffer::register(&stream, true).unwrap();
    assert!(again.is_interleaved());
}

#[derive(Debug, Default)]
struct Observed {
    input: Vec<f32>,
    not_locked: bool,
    double_unlock: bool,
    mismatch: bool,
}

#[test]
fn safe_buffer_lock_unlock() {
    let device = SimDeviceConfig {
        signal: Signal::Constant(0.25),
        ..SimDeviceConfig::new("Duplex", 2, 2)
    };
    let (_platform, backend, service) = setup(vec![device]);
    let mut tap = backend.tap(0, 1 << 14).unwrap();
    let device = service.open_device(0).unwrap();

    let (sender, receiver) = oneshot::channel();
    let mut sender = Some(sender);

    let on_buffer = move |cb: &mut Callback<'_, '_>| {
        let mut safe = cb.safe_buffer();
        let mut observed = Observed {
            not_locked: matches!(
                safe.input::<f32>(),
                Err(e) if matches!(e.kind(), ErrorKind::NotLocked)
            ),
            ..Observed::default()
        };

        let result: Result<()> = (|| {
            safe.lock()?;

            let input = safe.input::<f32>()?;
            observed.input = vec![input.get(0, 0), input.get(0, 1)];

            observed.mismatch = matches!(
                safe.output::<i16>(),
                Err(e) if matches!(e.kind(), ErrorKind::SampleMismatch { .. })
            );

            let mut output = safe.output::<f32>()?;
            output.channel_mut(0).into_iter().flatten().for_each(|v| *v = 0.5);
            output.channel_mut(1).into_iter().flatten().for_each(|v| *v = -0.5);

            safe.unlock()?;
            observed.double_unlock =
                matches!(safe.unlock(), Err(e) if matches!(e.kind(), ErrorKind::NotLocked));
            Ok(())
        })();

        if result.is_ok() {
            if let Some(sender) = sender.take() {
                let _ = sender.send(observed);
            }
        }
    };

    let mut stream = device
        .open_stream(params(
            format(48000, 2, 2),
            10.0,
            StreamParams::new(true, on_buffer),
        ))
        .unwrap();
    let safe = SafeBuffer::register(&stream, false).unwrap();

    stream.start().unwrap();
    let observed = receiver.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut samples = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        samples.extend(tap.read());
        samples.len() >= 8
    }));

    stream.stop().unwrap();
    drop(safe);
    stream.destroy().unwrap();

    assert!(observed.not_locked);
    assert!(observed.mismatch);
    assert!(observed.double_unlock);
    assert_eq!(observed.input, vec![0.25, 0.25]);
    assert_eq!(&samples[..4], &[0.5, -0.5, 0.5, -0.5]);
}

#[test]
fn access_mode_is_emulated() {
    let device = SimDeviceConfig {
        interleaved: false,
        signal: Signal::Constant(-0.5),
        ..SimDeviceConfig::new("Planar", 2, 2)
    };
    let (_platform, backend, service) = setup(vec![device]);
    let mut tap = backend.tap(0, 1 << 14).unwrap();
    let device = service.open_device(0).unwrap();
    assert!(!device.supports_access(true).unwrap());

    let shaped = Arc::new(AtomicBool::new(false));
    let flag = shaped.clone();
    let on_buffer = move |cb: &mut Callback<'_, '_>| {
        let frames = cb.frames();
        let buffer = cb.buffer_mut();

        if let Some(NativeInput::Interleaved(input)) = &buffer.input {
            let first = f32::from_ne_bytes([input[0], input[1], input[2], input[3]]);
            flag.store(input.len() == frames * 8 && first == -0.5, Ordering::Relaxed);
        }

        if let Some(NativeOutput::Interleaved(output)) = &mut buffer.output {
            for (i, bytes) in output.chunks_exact_mut(4).enumerate() {
                let value: f32 = if i % 2 == 0 { 0.25 } else { 0.75 };
                bytes.copy_from_slice(&value.to_ne_bytes());
            }
        }
    };

    let mut stream = device
        .open_stream(params(
            format(48000, 2, 2),
            10.0,
            StreamParams::new(true, on_buffer),
        ))
        .unwrap();
    assert!(stream.is_interleaved());

    stream.start().unwrap();
    let mut samples = Vec::new();
    assert!(wait_until(Duration::from_secs(5), || {
        samples.extend(tap.read());
        samples.len() >= 4
    }));
    stream.destroy().unwrap();

    assert!(shaped.load(Ordering::Relaxed));
    assert_eq!(&samples[..4], &[0.25, 0.75, 0.25, 0.75]);
}

#[test]
fn injected_xruns_are_reported() {
    let device = SimDeviceConfig {
        faults: FaultPlan {
            xrun_periods: vec![2],
            ..FaultPlan::default()
        },
        ..SimDeviceConfig::new("Glitchy", 1, 1)
    };
    let (_platform, _backend, service) = setup(vec![device]);
    let device = service.open_device(0).unwrap();

    let flagged = Arc::new(AtomicUsize::new(0));
    let reported = Arc::new(AtomicUsize::new(0));
    let (flag, report) = (flagged.clone(), reported.clone());

    let stream = StreamParams::new(true, move |cb: &mut Callback<'_, '_>| {
        if cb.xrun() {
            flag.fetch_add(1, Ordering::Relaxed);
        }
    })
    .on_xrun(move |index| {
        assert_eq!(index, 0);
        report.fetch_add(1, Ordering::Relaxed);
    });

    let mut stream = device
        .open_stream(params(format(48000, 1, 1), 5.0, stream))
        .unwrap();
    stream.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        reported.load(Ordering::Relaxed) >= 1
    }));
    stream.destroy().unwrap();

    assert!(flagged.load(Ordering::Relaxed) >= 1);
}

#[test]
fn fatal_error_surfaces_on_next_call() {
    let device = SimDeviceConfig {
        faults: FaultPlan {
            fail_after: Some(3),
            ..FaultPlan::default()
        },
        ..SimDeviceConfig::new("Flaky", 0, 2)
    };
    let (_platform, backend, service) = setup(vec![device]);
    let device = service.open_device(0).unwrap();

    let mut stream = device
        .open_stream(params(format(48000, 0, 2), 5.0, idle()))
        .unwrap();
    stream.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        stream.state() == StreamState::Stopped
    }));

    let error = stream.stop().unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::DeviceLost));
    assert_eq!(error.system(), Some(System::Simulated));
    assert_eq!(error.category(), Category::FatalResource);
    assert_eq!(backend.running_streams(), 0);

    stream.stop().unwrap();

    stream.start().unwrap();
    stream.destroy().unwrap();
    assert_eq!(backend.open_streams(), 0);
}

#[test]
fn refused_start_leaves_stream_usable() {
    let device = SimDeviceConfig {
        faults: FaultPlan {
            refuse_start: true,
            ..FaultPlan::default()
        },
        ..SimDeviceConfig::new("Stubborn", 1, 0)
    };
    let (_platform, backend, service) = setup(vec![device]);
    let device = service.open_device(0).unwrap();

    let mut stream = device
        .open_stream(params(format(48000, 1, 0), 5.0, idle()))
        .unwrap();

    let error = stream.start().unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::Backend { .. }));
    assert_eq!(stream.state(), StreamState::Created);
    assert_eq!(backend.running_streams(), 0);

    let error = stream.start().unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::Backend { .. }));
}

#[test]
fn terminate_waits_for_streams() {
    let (platform, _backend, service) = setup(vec![SimDeviceConfig::new("Duplex", 2, 2)]);
    let device = service.open_device(0).unwrap();
    let stream = device
        .open_stream(params(format(48000, 2, 2), 10.0, idle()))
        .unwrap();

    let error = platform.terminate().unwrap_err();
    assert!(matches!(error.kind(), ErrorKind::InvalidState { .. }));

    stream.destroy().unwrap();
    platform.terminate().unwrap();

    assert!(device.name().is_err());
    assert!(service.open_device(0).is_err());
}

#[test]
fn default_devices() {
    let (_platform, _backend, service) = setup(vec![
        SimDeviceConfig::new("Speakers", 0, 2),
        SimDeviceConfig::new("Microphone", 1, 0),
    ]);

    let output = service.open_default_device(true).unwrap().unwrap();
    assert_eq!(output.name().unwrap(), "Speakers");
    let input = service.open_default_device(false).unwrap().unwrap();
    assert_eq!(input.name().unwrap(), "Microphone");
    assert_eq!(input.id().index, 1);
    assert_ne!(input.id(), service.open_device(1).unwrap().id());
}
