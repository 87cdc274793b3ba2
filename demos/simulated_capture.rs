// Capture without hardware
//
// This example runs the acquisition engine against a simulated LWLA1016
// streaming a counter pattern, and prints what each channel did.

use clap::Parser;
use lwla_rs::{
    AcquisitionController, CaptureBuffer, ChannelTriggerBuilder, DeviceModel, DeviceSession,
    SimulatedDevice, TriggerMatch, DEFAULT_POLL_TIMEOUT,
};

#[derive(Parser)]
#[command(name = "simulated_capture")]
#[command(version = "0.1")]
#[command(about = "Run an LWLA capture against a simulated device")]
struct Args {
    /// Number of samples the simulated device streams
    #[arg(short, long, default_value_t = 4096)]
    samples: u64,

    /// Stop after this many samples, 0 for no limit
    #[arg(short, long, default_value_t = 1000)]
    limit: u64,

    /// Optional CSV output file
    #[arg(short, long)]
    output: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let model = DeviceModel::LWLA1016;
    let mut device = SimulatedDevice::new(model);
    let counter: Vec<u64> = (0..args.samples).map(|i| i & 0xffff).collect();
    let (before, after) = counter.split_at(counter.len() / 4);
    device.queue_samples(before);
    device.queue_trigger();
    device.queue_samples(after);
    device.queue_capture_done();

    let mut controller = AcquisitionController::new(DeviceSession::new(device, model), CaptureBuffer::new());
    controller.open()?;
    controller.session_mut().set_sample_limit(args.limit);
    controller.configure_trigger_masks(
        ChannelTriggerBuilder::new(model.channel_count)
            .enable_all()
            .trigger(0, TriggerMatch::Rising)
            .build()?,
    )?;

    controller.start_acquisition()?;
    let trailer = controller.run(DEFAULT_POLL_TIMEOUT)?;
    println!("Captured {} samples ({:?})", trailer.samples, trailer.end);

    let (device, capture) = controller.close();
    println!("Device saw {} commands", device.commands().len());
    if !capture.triggers.is_empty() {
        println!("Trigger at sample {:?}", capture.triggers);
    }

    let df = capture.to_dataframe()?;
    for channel in model.all_channels().iter().take(4) {
        let name = model.channel_name(channel);
        let toggles = df
            .column(&name)?
            .bool()?
            .into_no_null_iter()
            .collect::<Vec<_>>()
            .windows(2)
            .filter(|w| w[0] != w[1])
            .count();
        println!("  {}: {} transitions", name, toggles);
    }

    if let Some(path) = &args.output {
        capture.write_csv(path)?;
        println!("Wrote {}", path);
    }
    Ok(())
}
