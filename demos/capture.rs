// Capture from a connected LWLA to CSV
//
// This example opens the first LWLA found on the bus, applies the triggers
// given on the command line and writes the capture to a CSV file.

use clap::Parser;
use lwla_rs::{
    AcquisitionController, CaptureBuffer, ChannelSpec, ClockSource, DeviceModel, DeviceSession,
    LwlaDriver, SAMPLE_RATES,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "capture")]
#[command(version = "0.1")]
#[command(about = "Capture logic samples from an LWLA to CSV")]
#[command(long_about = "Arms the first connected LWLA logic analyzer, streams samples until the limit is reached and stores them as CSV with one column per enabled channel.")]
struct Args {
    /// Output file
    #[arg(short, long, default_value = "capture.csv")]
    output: String,

    /// Device model
    #[arg(short, long, default_value = "lwla1034", value_parser = ["lwla1016", "lwla1034"])]
    model: String,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    rate: u64,

    /// Number of samples to capture
    #[arg(short, long, default_value_t = 100_000)]
    limit: u64,

    /// Enabled channels, counted from 1. All channels when omitted
    #[arg(short, long, value_delimiter = ',')]
    channels: Vec<usize>,

    /// Trigger as CHANNEL=TYPE, e.g. 3=r. Types are 0, 1, r and f
    #[arg(short, long)]
    trigger: Vec<String>,

    /// Sample on the rising edge of the external clock input
    #[arg(long)]
    external_clock: bool,

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

    let model = match args.model.as_str() {
        "lwla1016" => DeviceModel::LWLA1016,
        _ => DeviceModel::LWLA1034,
    };
    if !SAMPLE_RATES.contains(&args.rate) {
        eprintln!("Unsupported sample rate {}. Pick one of {:?}", args.rate, SAMPLE_RATES);
        std::process::exit(1);
    }

    let mut triggers = vec![String::new(); model.channel_count];
    for trigger in &args.trigger {
        let Some((channel, kind)) = trigger.split_once('=') else {
            eprintln!("Invalid trigger {}. Use CHANNEL=TYPE", trigger);
            std::process::exit(1);
        };
        match channel.parse::<usize>() {
            Ok(channel) if (1..=model.channel_count).contains(&channel) => {
                triggers[channel - 1] = kind.to_string();
            }
            _ => {
                eprintln!("Invalid channel {} for {}", channel, model.name);
                std::process::exit(1);
            }
        }
    }
    let specs: Vec<ChannelSpec> = triggers
        .iter()
        .enumerate()
        .map(|(i, trigger)| {
            let enabled = args.channels.is_empty() || args.channels.contains(&(i + 1));
            ChannelSpec::new(enabled, trigger)
        })
        .collect();

    println!("LWLA Capture");
    println!("============");

    let mut driver = LwlaDriver::new();
    let devices = driver.scan()?;
    let Some(device) = devices.first().cloned() else {
        eprintln!("No LWLA device connected");
        std::process::exit(1);
    };
    println!("Using {} as {}", device, model.name);

    let transport = driver.open(&device)?;
    let mut controller = AcquisitionController::new(DeviceSession::new(transport, model), CaptureBuffer::new());
    if args.external_clock {
        controller
            .session_mut()
            .set_clock_source(ClockSource::ExternalRisingEdge)?;
    }
    controller.open()?;
    controller.session_mut().set_sample_rate(args.rate)?;
    controller.session_mut().set_sample_limit(args.limit);
    controller.configure_channels_and_triggers(&specs)?;

    println!("Capturing {} samples at {} Hz...", args.limit, args.rate);
    let start_time = std::time::Instant::now();
    controller.start_acquisition()?;
    let trailer = controller.run(Duration::from_millis(100))?;
    println!(
        "✓ {} samples in {:.3}s ({:?})",
        trailer.samples,
        start_time.elapsed().as_secs_f64(),
        trailer.end
    );

    let (_transport, capture) = controller.close();
    if !capture.triggers.is_empty() {
        println!("Trigger fired at sample {:?}", capture.triggers);
    }
    capture.write_csv(&args.output)?;
    println!("Wrote {}", args.output);

    Ok(())
}
