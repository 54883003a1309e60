//! hdhr-meter: terminal signal meter for HDHomeRun tuners.
//!
//! Drives a [`DeviceController`] over the simulated tuner backend (the
//! real driver binding is an external collaborator), prints every event
//! the controller publishes, and keeps polling tuner status until
//! Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};

use hdhr_meter::config::resolve_config;
use hdhr_meter::controller::{BusyIndicator, DeviceController};
use hdhr_meter::driver::sim::{SimBackend, SimLineup};
use hdhr_meter::logging::init_logging;
use hdhr_types::{ChannelScanProgram, DeviceDescriptor, DeviceType, VirtualChannel};

/// hdhr-meter - signal meter and channel scanner for HDHomeRun tuners
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device id to bind
    #[arg(short = 'd', long, default_value = "1038A4C7")]
    device_id: String,

    /// Device IP address
    #[arg(short, long, default_value = "192.168.1.100")]
    addr: String,

    /// Tuner index on the device
    #[arg(short, long, default_value = "0")]
    tuner: u32,

    /// Device type (atsc or cablecard)
    #[arg(long, default_value = "atsc")]
    device_type: String,

    /// Channel to tune after startup
    #[arg(short, long)]
    channel: Option<String>,

    /// Treat the channel argument as a CableCard virtual channel
    #[arg(long)]
    virtual_tune: bool,

    /// Run a full channel scan after startup
    #[arg(long)]
    scan: bool,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Busy indicator rendered as a terminal spinner.
struct SpinnerIndicator {
    bar: ProgressBar,
}

impl SpinnerIndicator {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message("idle");
        Self { bar }
    }
}

impl BusyIndicator for SpinnerIndicator {
    fn set_busy(&self, busy: bool) {
        self.bar
            .set_message(if busy { "tuner busy" } else { "idle" });
    }
}

/// Build the simulated backend the meter runs against.
fn build_backend(device_type: DeviceType) -> (SimBackend, SimLineup) {
    match device_type {
        DeviceType::Atsc => {
            let backend = SimBackend::new(DeviceType::Atsc)
                .with_map("us-bcast", (2..=69).collect())
                .with_programs(
                    12,
                    vec![
                        ChannelScanProgram::new(1, "WNBC-HD", 4, 1),
                        ChannelScanProgram::new(2, "COZI", 4, 2),
                    ],
                )
                .with_programs(33, vec![ChannelScanProgram::new(3, "WABC-HD", 7, 1)]);
            (backend, SimLineup::new(Vec::new()))
        }
        DeviceType::CableCard => {
            let backend = SimBackend::new(DeviceType::CableCard)
                .with_map("us-cable", (2..=135).collect())
                .with_programs(80, vec![ChannelScanProgram::new(1, "HBO-HD", 501, 0)])
                .with_programs(135, vec![ChannelScanProgram::new(2, "AMC-HD", 702, 0)])
                .with_virtual_channel("501", 80)
                .with_virtual_channel("702", 135);
            let lineup = SimLineup::new(vec![
                VirtualChannel::new("501", "HBO-HD"),
                VirtualChannel::new("702", "AMC-HD"),
            ]);
            (backend, lineup)
        }
    }
}

fn subscribe_printers(controller: &DeviceController) {
    let events = controller.events();

    events.channel_changed.subscribe(|change| {
        if change.response.is_success() {
            info!("channel changed -> {}", change.channel);
        } else {
            info!(
                "channel change failed: {}",
                change.response.text(hdhr_types::KEY_ERROR).unwrap_or("?")
            );
        }
    });
    events.channel_map_changed.subscribe(|change| {
        info!(
            "channel map -> {} ({})",
            change.map,
            if change.response.is_success() { "ok" } else { "failed" }
        );
    });
    events.channel_map_list_changed.subscribe(|maps| {
        info!("channel maps available: {}", maps.join(", "));
    });
    events.program_list_changed.subscribe(|change| {
        let names: Vec<&str> = change.programs.iter().map(|p| p.name.as_str()).collect();
        info!(
            "programs on channel {}: [{}]",
            change.channel,
            names.join(", ")
        );
    });
    events.program_changed.subscribe(|change| {
        match &change.program {
            Some(program) => info!(
                "program -> {} ({}.{} {})",
                program.program_number, program.virtual_major, program.virtual_minor, program.name
            ),
            None => info!("program cleared"),
        }
    });
    events.channel_locked.subscribe(|locked| {
        info!(
            "lock: {} on {} (ss {}% snq {}%)",
            locked.status.lock,
            locked.status.channel,
            locked.status.signal_strength,
            locked.status.signal_to_noise_quality
        );
    });
    events.tuner_status_changed.subscribe(|change| {
        info!(
            "status: {} lock={} ss={}% snq={}% seq={}%",
            change.status.channel,
            change.status.lock,
            change.status.signal_strength,
            change.status.signal_to_noise_quality,
            change.status.symbol_error_quality
        );
    });
    events.scan_complete.subscribe(|complete| {
        info!(
            "scan complete ({})",
            if complete.response.is_success() { "ok" } else { "failed" }
        );
    });
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = resolve_config(args.config.clone())?;

    let log_dir = file_config
        .logging
        .log_dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| args.log_dir.clone());
    let retention = file_config
        .logging
        .retention_days
        .unwrap_or(args.log_retention_days);
    init_logging(&log_dir, retention, args.verbose)?;

    let device_type = match file_config
        .device
        .device_type
        .as_deref()
        .unwrap_or(&args.device_type)
    {
        "cablecard" => DeviceType::CableCard,
        _ => DeviceType::Atsc,
    };
    let descriptor = DeviceDescriptor::new(
        file_config.device.id.clone().unwrap_or(args.device_id),
        file_config.device.addr.clone().unwrap_or(args.addr),
        file_config.device.tuner.unwrap_or(args.tuner),
    );

    info!("binding {device_type} tuner {descriptor}");
    let (backend, lineup) = build_backend(device_type);
    let controller = DeviceController::new(
        Arc::new(backend),
        descriptor,
        Arc::new(SpinnerIndicator::new()),
        Some(Arc::new(lineup)),
        file_config.controller.clone(),
    )?;

    subscribe_printers(&controller);

    if let Some(channel) = &args.channel {
        if let Err(e) = controller.set_tuner_channel(channel, args.virtual_tune) {
            error!("{e}");
        }
    }
    if args.scan {
        controller.full_channel_scan()?;
    }

    controller.start_tuner_status_updates();

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    info!("signal meter running; press Ctrl-C to exit");
    let _ = stop_rx.recv();

    info!("shutting down");
    controller.stop_tuner_status_updates();
    controller.destroy_device();
    controller.drain_and_stop();

    Ok(())
}
