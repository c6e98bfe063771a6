use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use cnea_daq::{
    config::LogSettings,
    pixel::{load_stim_pixels_csv, GainMode},
    processing::{frame_from_words, words_from_bytes, FrameProcessor},
    simulator::{CHANNELS, SAMPLES_PER_FRAME},
    AcquisitionService, BlockNotice, Conf, DeviceContext, HardwareControl, NotificationSink,
};
use crossbeam_channel::{bounded, tick};
use log::{info, warn, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::{
    collections::BTreeMap,
    fs::File,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

/// Frames processed per status tick; the rest stay in the buffer.
const FRAMES_PER_TICK: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "cnea-daq", version, about = "CNEA electrode array acquisition and control")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the device and print its state
    Info,
    /// Record for a fixed time, running spike detection on the stream
    Record {
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Apply a batch of bias voltages
    Bias {
        /// NAME=VOLTS, repeatable
        #[arg(long = "set", value_parser = parse_assignment, conflicts_with = "defaults")]
        set: Vec<(String, f64)>,
        /// Restore every bias to its default
        #[arg(long)]
        defaults: bool,
    },
    /// Configure the array gain mode and stimulation pixel groups
    Pixels {
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long, default_value = "GainX100")]
        gain: String,
    },
}

fn parse_assignment(s: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VOLTS, got {}", s))?;
    let volts = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad voltage {:?}: {}", value, e))?;
    Ok((name.trim().to_string(), volts))
}

fn init_logging(settings: &LogSettings) -> Result<()> {
    let level: LevelFilter = settings
        .level
        .parse()
        .with_context(|| format!("invalid log level {:?}", settings.level))?;

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &settings.file {
        let file = File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, Config::default(), file));
    }
    CombinedLogger::init(loggers).map_err(|e| anyhow!("failed to initialise logging: {}", e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Conf::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    init_logging(&config.log)?;

    let ctx = DeviceContext::probe(&config.device);
    let mut hw = HardwareControl::new(ctx.clone());
    if !hw.startup() {
        warn!("Continuing without a working device");
    }

    let result = match cli.command {
        Command::Info => {
            print_report(&hw);
            Ok(())
        }
        Command::Record { seconds } => record(&config, ctx, Duration::from_secs(seconds)),
        Command::Bias { set, defaults } => apply_bias(&mut hw, set, defaults),
        Command::Pixels { csv, gain } => configure_pixels(&mut hw, csv, &gain),
    };

    hw.shutdown();
    result
}

fn print_report(hw: &HardwareControl) {
    let report = hw.device_report();
    let info = &report.info;
    println!("Board:\t\t{}", info.board_model);
    println!("Serial:\t\t{}", info.serial);
    println!("Device ID:\t{}", info.device_id);
    println!("Firmware:\t{}.{}", info.firmware_major, info.firmware_minor);
    println!("Simulated:\t{}", report.simulated);
    println!("Gain mode:\t{}", report.gain_mode);
    println!("Pixels:\t\t{} selected", report.selected_pixels);
    println!("Stimulation:\t{}", if report.stimulation.is_active { "active" } else { "idle" });
    println!();
    for clk in &report.clocks {
        println!("{:<10}{:>6}  {:>14.1} Hz", clk.name, clk.divider, clk.frequency_hz);
    }
    println!();
    for b in &report.bias {
        println!("{:<12}{:>8.4} V  (code {:>5})", b.name, b.voltage, b.dac_code);
    }
}

fn record(config: &Conf, ctx: DeviceContext, duration: Duration) -> Result<()> {
    let settings = &config.acquisition;
    let mut acq = AcquisitionService::new(ctx, settings);
    let (tx_notice, rx_notice) = bounded::<BlockNotice>(1024);
    let sink: Arc<dyn NotificationSink> = Arc::new(tx_notice);
    acq.set_notification_sink(Some(sink));

    let session = acq
        .start(settings.channel_mask(), settings.sample_rate_hz)
        .context("failed to start acquisition")?;
    info!("Recording session {} for {:?}", session, duration);

    let buffer = acq.ring_buffer();
    let frame_bytes = CHANNELS * SAMPLES_PER_FRAME * 2;
    let mut processor = FrameProcessor::new(&config.processing, settings.sample_rate_hz);
    let mut total_spikes = 0u64;
    let mut frames = 0u64;

    let ticker = tick(Duration::from_secs(1));
    let t_begin = Instant::now();
    while t_begin.elapsed() < duration {
        let _ = ticker.recv();
        let blocks = rx_notice.try_iter().count();

        for _ in 0..FRAMES_PER_TICK {
            if buffer.available() < frame_bytes {
                break;
            }
            let Some(bytes) = buffer.read(frame_bytes) else {
                break;
            };
            let frame = frame_from_words(&words_from_bytes(&bytes), CHANNELS);
            let result = processor.process(&frame)?;
            total_spikes += result.total_spikes;
            frames += 1;
        }

        let status = acq.status();
        println!(
            "{:>6.1} s | {:>7} iterations | {:>3} blocks | {:>8.2} MB/s | buffer {:>5.1}% | {} spikes",
            status.elapsed_s,
            status.iteration_count,
            blocks,
            status.throughput_mbps,
            status.buffer_fill_pct,
            total_spikes
        );
    }

    let summary = acq.stop().context("failed to stop acquisition")?;
    let stats = acq.ring_buffer().stats();
    println!();
    println!("Session:\t{}", summary.session_id);
    println!("Elapsed:\t{:.2} s", summary.elapsed_s);
    println!("Iterations:\t{}", summary.iteration_count);
    println!("Bytes read:\t{}", summary.bytes_read);
    println!("Dropped:\t{}", summary.packets_dropped);
    println!("Overflows:\t{}", stats.overflow_count);
    println!("Frames:\t\t{} ({} spikes)", frames, total_spikes);
    Ok(())
}

fn apply_bias(hw: &mut HardwareControl, set: Vec<(String, f64)>, defaults: bool) -> Result<()> {
    let changes = if defaults {
        hw.bias.apply_defaults()?
    } else {
        if set.is_empty() {
            bail!("nothing to do: pass --set NAME=VOLTS or --defaults");
        }
        let batch: BTreeMap<String, f64> = set.into_iter().collect();
        hw.bias.set_multiple(&batch).context("bias batch rejected")?
    };
    for c in &changes {
        println!("{:<12}{:>8.4} V -> {:>8.4} V  (code {:>5})", c.name, c.old_v, c.new_v, c.dac_code);
    }
    Ok(())
}

fn configure_pixels(hw: &mut HardwareControl, csv: Option<PathBuf>, gain: &str) -> Result<()> {
    let mode: GainMode = gain.parse()?;
    let groups = match csv {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            load_stim_pixels_csv(&content)
        }
        None => Vec::new(),
    };
    let summary = hw.pixel.configure(mode, groups)?;
    println!(
        "Gain mode {} ({:#012x}), {} groups covering {} pixels",
        summary.gain_mode, summary.config_word, summary.groups, summary.group_pixels
    );
    Ok(())
}
