//! lowlat - 低延迟音频播放/录音
//!
//! 命令行包装 `AudioController`：init → start → wait → close。
//! 流总是在工作线程中运行，Ctrl+C 通过流的控制句柄发出 stop。

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};

use lowlat_audio::audio::{create_backend, BitDepth, Direction};
use lowlat_audio::config::{
    parse_flag, parse_key_list, BackendKind, ConfigError, DeviceConfig, EngineConfig,
    FileExistsPolicy, StartOptions, StreamDuration,
};
use lowlat_audio::engine::{KeySource, TerminalKeys};
use lowlat_audio::{AudioController, StreamReport};

/// Low-latency WAV playback and recording
#[derive(Parser)]
#[command(name = "lowlat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List playback and capture devices
    Devices {
        /// Backend: default, a cpal host name (alsa, jack, ...) or null
        #[arg(long, default_value = "default")]
        backend: BackendKind,
    },

    /// Play a WAV file
    Play {
        /// WAV file to play
        file: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,

        #[command(flatten)]
        stream: StreamArgs,

        /// Load the whole file into RAM before playback (yes/no)
        #[arg(long, default_value = "yes", value_parser = parse_ram_cache, action = ArgAction::Set)]
        ram_cache: bool,
    },

    /// Record to a WAV file
    Record {
        /// Target file ('.wav' is appended when missing)
        file: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,

        #[command(flatten)]
        stream: StreamArgs,

        /// Keep the recording in RAM and write it when done (yes/no)
        #[arg(long, default_value = "no", value_parser = parse_ram_cache, action = ArgAction::Set)]
        ram_cache: bool,

        /// Keep recording this many ms after a stop
        #[arg(long, default_value_t = 0)]
        stop_delay: u64,

        /// What to do when the file exists: overwrite or suffix
        #[arg(long, default_value = "suffix")]
        file_exists: FileExistsPolicy,

        /// Directory for relative target paths
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Args)]
struct DeviceArgs {
    /// Backend: default, a cpal host name (alsa, jack, ...) or null
    #[arg(long, default_value = "default")]
    backend: BackendKind,

    /// Device name (default device when omitted)
    #[arg(short, long)]
    device: Option<String>,

    /// Bit depth: 8, 16, 24 or 32
    #[arg(long, default_value_t = 16)]
    bitdepth: u16,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 44100)]
    samplerate: u32,

    #[arg(long, default_value_t = 2)]
    channels: u16,

    /// Frames per period
    #[arg(long, default_value_t = 1024)]
    period_size: u32,

    /// Periods per device buffer
    #[arg(long, default_value_t = 4)]
    periods: u32,

    /// Simulate timing without touching any device or file
    #[arg(long)]
    dummy: bool,
}

#[derive(Args)]
struct StreamArgs {
    /// Duration in ms, or 'sound' / 'infinite' to run until the natural end
    #[arg(long)]
    duration: Option<StreamDuration>,

    /// Start delay in ms
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// ';'-separated keys that toggle pause
    #[arg(long, default_value = "")]
    pause_keys: String,

    /// ';'-separated keys that stop the stream
    #[arg(long, default_value = "")]
    stop_keys: String,

    /// Print a timestamp for every period
    #[arg(long)]
    timestamps: bool,
}

fn parse_ram_cache(value: &str) -> Result<bool, ConfigError> {
    parse_flag("ram_cache", value)
}

impl DeviceArgs {
    fn engine_config(&self, base_dir: PathBuf) -> Result<EngineConfig, ConfigError> {
        Ok(EngineConfig {
            device: DeviceConfig {
                backend: self.backend.clone(),
                device_id: self.device.clone(),
                bit_depth: BitDepth::try_from(self.bitdepth)?,
                sample_rate: self.samplerate,
                channels: self.channels,
                period_size: self.period_size,
                periods_per_buffer: self.periods,
            },
            dummy_mode: self.dummy,
            base_dir,
        })
    }
}

impl StreamArgs {
    fn apply(&self, options: &mut StartOptions) {
        options.duration = self.duration.unwrap_or(StreamDuration::Natural);
        options.delay_ms = self.delay;
        options.pause_keys = parse_key_list(&self.pause_keys);
        options.stop_keys = parse_key_list(&self.stop_keys);
        options.period_timestamps = self.timestamps;
        options.background = true;

        // raw mode 下 Ctrl+C 作为按键到达，不再产生 SIGINT
        if !options.pause_keys.is_empty() || !options.stop_keys.is_empty() {
            options.stop_keys.push("ctrl+c".to_string());
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Devices { ref backend } => list_devices(backend),
        Commands::Play {
            ref file,
            ref device,
            ref stream,
            ram_cache,
        } => {
            let mut options = StartOptions::playback(file);
            options.ram_cache = ram_cache;
            stream.apply(&mut options);
            let config = device.engine_config(PathBuf::from("."))?;
            run_stream(Direction::Playback, config, options, cli.verbose)
        }
        Commands::Record {
            ref file,
            ref device,
            ref stream,
            ram_cache,
            stop_delay,
            file_exists,
            ref dir,
        } => {
            let mut options = StartOptions::capture(file);
            options.ram_cache = ram_cache;
            options.stop_delay_ms = stop_delay;
            options.file_exists = file_exists;
            stream.apply(&mut options);
            let config = device.engine_config(dir.clone())?;
            run_stream(Direction::Capture, config, options, cli.verbose)
        }
    }
}

/// 显示设备列表
fn list_devices(kind: &BackendKind) -> anyhow::Result<()> {
    let backend = create_backend(kind);

    for direction in [Direction::Playback, Direction::Capture] {
        println!("=== {} devices ({}) ===\n", direction, backend.name());
        let devices = backend
            .enumerate(direction)
            .with_context(|| format!("failed to list {} devices", direction))?;
        for device in &devices {
            let default_mark = if device.is_default { " *" } else { "" };
            println!("  {}{}", device.id, default_mark);
        }
        println!();
    }
    println!("* = system default");

    Ok(())
}

fn run_stream(
    direction: Direction,
    config: EngineConfig,
    options: StartOptions,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut controller = AudioController::new(direction).with_key_source(|| match TerminalKeys::new() {
        Ok(keys) => Some(Box::new(keys) as Box<dyn KeySource>),
        Err(e) => {
            log::warn!("Keyboard control unavailable: {}", e);
            None
        }
    });

    controller
        .init(config)
        .with_context(|| format!("failed to open {} device", direction))?;
    // start 之后终端可能处于 raw mode，提示要在此之前输出
    if direction == Direction::Capture {
        println!("Recording... press Ctrl+C to stop");
    }
    let id = controller.start(options).context("failed to start stream")?;

    let control = controller.control(id)?;
    ctrlc::set_handler(move || control.request_stop())?;

    let report = controller.wait(id)?;
    controller.close();

    print_report(&report, verbose);
    Ok(())
}

fn print_report(report: &StreamReport, verbose: bool) {
    print!("{}", report);

    if !report.period_timestamps.is_empty() {
        println!("\nPeriod timestamps (ms):");
        for stamp in &report.period_timestamps {
            println!("  {:.3}", stamp);
        }
    }

    if verbose {
        println!();
        print!("{}", report.stats);
    }
}
