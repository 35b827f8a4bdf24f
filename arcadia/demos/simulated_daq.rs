//! Run the acquisition pipeline against a simulated board. The simulated chips produce a stream of
//! pixel hits with the odd timestamp overflow, which is drained by one worker per chip until a
//! target, a timeout or Ctrl-C ends the run.
//!
//! ```text
//! cargo run --example simulated_daq -- --stop-after 100000 --calibrate -vv
//! ```

use anyhow::Context;
use arcadia::{
    core::CHIPS,
    packet::Packet,
    prelude::*,
    transport::mock::FifoSource,
};
use clap::Parser;
use indicatif::{
    ProgressBar,
    ProgressStyle,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Packets to capture per chip, zero runs until interrupted
    #[arg(short, long, default_value_t = 10_000)]
    stop_after: usize,
    /// Give up on a run after this many seconds
    #[arg(short, long)]
    timeout: Option<f64>,
    /// Give up once no data was seen for this many seconds
    #[arg(short, long)]
    idle_timeout: Option<f64>,
    /// Calibrate the deserializers before acquiring
    #[arg(short, long)]
    calibrate: bool,
    /// Chip configuration to load before acquiring
    #[arg(long)]
    config: Option<PathBuf>,
    /// Chips to acquire from
    #[arg(long, value_delimiter = ',', default_values_t = [0usize, 1, 2])]
    chips: Vec<usize>,
    /// More output, repeat for transport logging
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Pixel hits in every region of the matrix, with a board timestamp overflow every 256 packets
fn synthetic_source(chip: usize) -> FifoSource {
    let mut n = 0u64;
    Box::new(move |free: usize| {
        let mut words = Vec::with_capacity(free.min(512));
        while words.len() + 2 <= free.min(512) {
            let packet = if n % 256 == 255 {
                0xf000_0000_0000_0000
            } else {
                let ts_fpga = (n * 3) & 0xff_ffff;
                let corepr = n % 127;
                let col = (n / 127) % 16;
                let sec = (n / 2032) % 16;
                ((chip as u64) << 56)
                    | (ts_fpga << 32)
                    | ((ts_fpga & 0xff) << 24)
                    | (sec << 20)
                    | (col << 16)
                    | (corepr << 9)
                    | (((n % 255) + 1) << 1)
            };
            words.push((packet >> 32) as u32);
            words.push(packet as u32);
            n += 1;
        }
        words
    })
}

fn seconds(s: Option<f64>) -> Option<Duration> {
    s.map(Duration::from_secs_f64)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    anyhow::ensure!(
        args.chips.iter().all(|&id| id < CHIPS),
        "The board only has chips 0 to {}",
        CHIPS - 1
    );
    let default_level = match args.verbose {
        0 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut mock = Mock::new();
    for chip in &args.chips {
        mock.set_fifo_source(*chip, synthetic_source(*chip));
    }
    let mut fpga = Fpga::new(mock, args.verbose > 0)?;
    fpga.set_transport_log_level(if args.verbose < 2 {
        LogLevel::Off
    } else {
        LogLevel::Error
    })?;
    fpga.dump_registers()?;

    if let Some(path) = &args.config {
        fpga.read_config(path)
            .with_context(|| format!("Loading {}", path.display()))?;
    }

    for &id in &args.chips {
        let chip = fpga.chip_mut(id)?;
        if args.calibrate {
            let report = chip.calibrate_deserializers(&CalibrationConfig {
                settle: Duration::from_millis(1),
            })?;
            info!(chip = id, locked = format!("{:#06x}", report.locked), "Calibrated");
        }
        chip.set_mode(ChipMode::Normal)?;
        chip.enable_readout(0xffff)?;
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))?;

    let config = DaqConfig {
        stop_after: args.stop_after,
        timeout: seconds(args.timeout),
        idle_timeout: seconds(args.idle_timeout),
    };
    for &id in &args.chips {
        fpga.chip_mut(id)?.start(config)?;
    }

    let total = (args.stop_after * args.chips.len()) as u64;
    let bar = if total == 0 {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::new(total)
    };
    bar.set_style(ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] {wide_bar} {pos}/{len} packets",
    )?);
    while fpga.chips().iter().any(Chip::is_running) {
        if interrupted.load(Ordering::Relaxed) {
            info!("Interrupted, stopping acquisition");
            fpga.stop_all();
            break;
        }
        bar.set_position(fpga.chips().iter().map(|c| c.packet_count() as u64).sum());
        thread::sleep(Duration::from_millis(50));
    }
    bar.finish();

    let outcomes = fpga.wait_all()?;
    for &id in &args.chips {
        let chip = fpga.chip_mut(id)?;
        let packets = chip.take_packets()?;
        let mut sequence = Sequence::new(packets.iter().copied());
        let mut hits = 0;
        for (_, packet) in sequence.by_ref() {
            if let Packet::ChipData(data) = packet {
                hits += data.pixels()?.len();
            }
        }
        info!(
            chip = id,
            outcome = ?outcomes[id],
            packets = packets.len(),
            overflows = sequence.overflows(),
            hits,
            "Run summary"
        );
    }
    Ok(())
}
