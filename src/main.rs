//! mjpeg-capture binary: registers the configured devices and runs the
//! capture loop.

use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use mjpeg_capture::{
    CaptureContext, DeviceRegistry, EngineConfig, FaultPolicy, Multiplexer, PollReadiness,
    V4l2Opener,
};

#[derive(Debug, Parser)]
#[command(version, about = "Capture MJPEG frames from V4L2 devices")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, default_value = "mjpeg-capture.toml")]
    config: PathBuf,

    /// Keep capturing from healthy devices when one fails.
    #[arg(long)]
    isolate_faults: bool,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> mjpeg_capture::traits::Result<()> {
    let args = Args::parse();
    let config = EngineConfig::from_file(&args.config)?;

    let registry = DeviceRegistry::shared(V4l2Opener);
    for device in &config.devices {
        match registry.register(CaptureContext::from_config(device)) {
            Ok(handle) => info!("{} ready as {handle}", device.path),
            Err(err) => warn!("skipping {}: {err}", device.path),
        }
    }
    if registry.is_empty() {
        warn!("no device could be registered");
    }

    let policy = if args.isolate_faults {
        FaultPolicy::Isolate
    } else {
        FaultPolicy::AbortLoop
    };
    let mut mux = Multiplexer::new(registry, PollReadiness).with_policy(policy);
    match mux.run()? {}
}
