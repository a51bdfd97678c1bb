use rxt_core::{Channels, Device, Format, Mix, Platform, Result, SampleType, Service};
use rxt_sim::SimBackend;
use tracing_subscriber::EnvFilter;

fn access_modes(device: &Device) -> Result<Vec<&'static str>> {
    [(true, "interleaved"), (false, "non-interleaved")]
        .into_iter()
        .filter_map(|(interleaved, name)| match device.supports_access(interleaved) {
            Ok(true) => Some(Ok(name)),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        })
        .collect()
}

fn print_device(device: &Device) -> Result<()> {
    println!("  Device {}: {}", device.id().index, device.name()?);

    for output in [false, true] {
        let label = if output { "Outputs" } else { "Inputs" };
        let count = device.channel_count(output)?;
        let names = (0..count)
            .map(|index| device.channel_name(output, index))
            .collect::<Result<Vec<_>>>()?;
        println!("    {label} ({count}): {}", names.join(", "));
    }

    println!("    Access: {}", access_modes(device)?.join(", "));

    let Some(mix) = device.mix()? else {
        println!("    Natural mix: none");
        return Ok(());
    };
    println!("    Natural mix: {} Hz, {:?}", mix.rate(), mix.sample());

    let channels = Channels::duplex(
        device.channel_count(false)?,
        device.channel_count(true)?,
    );
    let format = Format::new(mix, channels);
    if device.supports_format(&format)? {
        let size = device.buffer_size(&format)?;
        println!(
            "    Buffer size: {} ms (min {} ms, max {} ms)",
            size.current, size.min, size.max
        );
    }

    let samples = SampleType::ALL
        .iter()
        .filter_map(|&sample| {
            let mix = Mix::new(mix.rate(), sample).ok()?;
            match device.supports_format(&Format::new(mix, channels)) {
                Ok(true) => Some(Ok(format!("{sample:?}"))),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    println!("    Samples at {} Hz: {}", mix.rate(), samples.join(", "));

    Ok(())
}

fn print_service(service: &Service) -> Result<()> {
    println!("{} ({:?})", service.system(), service.setup());
    println!("  Capabilities: {}", service.capabilities());

    for index in 0..service.device_count()? {
        let device = service.open_device(index)?;
        print_device(&device)?;
    }

    Ok(())
}

fn run(platform: &Platform) -> Result<()> {
    println!("rxt {}", rxt_core::version());

    for system in platform.systems() {
        if let Some(service) = platform.service(system)? {
            print_service(&service)?;
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let platform = Platform::builder()
        .id("rxt-print")
        .backend(SimBackend::demo())
        .init();

    if let Err(e) = run(&platform) {
        eprintln!("{}", e.info());
        std::process::exit(1);
    }

    if let Err(e) = platform.terminate() {
        tracing::warn!("failed to terminate platform: {e}");
    }
}
