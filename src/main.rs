//! sles-play - buffer queue 输出驱动的命令行前端
//!
//! 在进程内模拟后端上运行完整的会话流程：
//! 打开 → 协商格式 → 分配 buffer → resume/prime → 回调驱动 → 关闭

use std::io::{self, Read as IoRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use sles_output::audio::backend::BackendCaps;
use sles_output::audio::buffer::DEFAULT_PERIOD_MS;
use sles_output::audio::format::{CHANNEL_LAYOUTS, FORMAT_MAP};
use sles_output::audio::output::{
    DRIVER_DESCRIPTION, DRIVER_NAME, FRAMES_PER_BUFFER_RANGE, SAMPLE_RATE_RANGE,
};
use sles_output::audio::{ChannelPolicy, OutputConfig, PrimeMode, ResetMode};
use sles_output::engine::{Engine, EngineConfig, PlaybackState};

/// 终端原始模式 RAII 守卫
struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    /// 进入原始模式，离开作用域自动恢复
    fn enter() -> Option<Self> {
        unsafe {
            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
                return None;
            }

            let mut raw = original;
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            // 非阻塞读取
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;

            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return None;
            }

            Some(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

fn read_char_nonblocking() -> Option<u8> {
    let mut buf = [0u8; 1];
    match io::stdin().lock().read(&mut buf) {
        Ok(1) => Some(buf[0]),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ResetArg {
    /// reset 真正停止并清空队列
    Stop,
    /// reset 只暂停，队列保留
    Pause,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PrimeArg {
    /// 入队一帧静音触发回调
    Marker,
    /// 在控制线程上同步 refill 一次
    Sync,
}

/// Buffer-queue audio output driver (simulated OpenSL ES backend)
#[derive(Parser)]
#[command(name = "sles-play")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Frames per buffer (default: 50 ms worth of frames)
    #[arg(long, global = true)]
    frames_per_buffer: Option<u32>,

    /// Fixed output sample rate in Hz
    #[arg(long, global = true)]
    sample_rate: Option<u32>,

    /// Lock the period buffer in memory
    #[arg(long, global = true)]
    lock_memory: bool,

    /// Backend accepts stereo only
    #[arg(long, global = true)]
    stereo_only: bool,

    /// What reset does on this backend
    #[arg(long, global = true, value_enum, default_value = "stop")]
    reset_mode: ResetArg,

    /// How the queue is primed after resume
    #[arg(long, global = true, value_enum, default_value = "marker")]
    prime: PrimeArg,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show driver information
    Info,

    /// Play a sine test tone
    Tone {
        /// Frequency in Hz
        #[arg(short, long, default_value = "440")]
        frequency: f64,

        /// Duration in seconds
        #[arg(short, long, default_value = "2")]
        duration: f64,

        /// Tone sample rate in Hz
        #[arg(short, long, default_value = "48000")]
        rate: u32,

        /// Channel count
        #[arg(short, long, default_value = "2")]
        channels: u16,
    },

    /// Play an audio file
    Play {
        /// Audio file to play
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Info => show_driver_info(),
        Commands::Tone {
            frequency,
            duration,
            rate,
            channels,
        } => {
            let mut engine = Engine::new(create_engine_config(&cli));
            println!(
                "Tone: {:.1} Hz for {:.1}s @ {} Hz, {} ch",
                frequency, duration, rate, channels
            );
            engine.play_tone(frequency, Some(duration), rate, channels)?;
            run_playback(&mut engine, Some(duration))
        }
        Commands::Play { ref file } => {
            let mut engine = Engine::new(create_engine_config(&cli));
            println!("Loading: {}", file.display());
            engine.play(file)?;
            let total = engine.current_info().and_then(|i| i.duration_secs);
            run_playback(&mut engine, total)
        }
    }
}

/// 显示驱动信息
fn show_driver_info() -> anyhow::Result<()> {
    println!("=== {} ===\n", DRIVER_NAME);
    println!("{}\n", DRIVER_DESCRIPTION);

    println!("Sample formats:");
    for (format, code) in FORMAT_MAP {
        println!("  {:<6} → PCM fixed {}", format.name(), code);
    }

    println!("\nChannel layouts:");
    for (channels, mask) in CHANNEL_LAYOUTS {
        println!("  {} ch  mask 0x{:04x}", channels, mask);
    }

    println!("\nOptions:");
    println!(
        "  frames per buffer  {}..={} (default: {} ms)",
        FRAMES_PER_BUFFER_RANGE.start(),
        FRAMES_PER_BUFFER_RANGE.end(),
        DEFAULT_PERIOD_MS
    );
    println!(
        "  sample rate        {}..={} Hz (default: source rate)",
        SAMPLE_RATE_RANGE.start(),
        SAMPLE_RATE_RANGE.end()
    );

    Ok(())
}

/// 播放循环：显示进度，处理 Ctrl+C 和键盘
fn run_playback(engine: &mut Engine, total_secs: Option<f64>) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    if let Some(session) = engine.session() {
        let format = session.format();
        println!(
            "Output: {} Hz, {} ch, {} | {} frames ({} bytes) per buffer",
            format.sample_rate,
            format.channels,
            format.sample_format,
            session.frames_per_period(),
            session.buffer_size()
        );
    }
    println!("Controls: [space] pause/resume | [q] or Ctrl+C quit\n");

    let _raw_guard = RawModeGuard::enter();

    while running.load(Ordering::SeqCst) && !engine.is_finished() {
        match read_char_nonblocking() {
            Some(b' ') => engine.toggle_pause()?,
            Some(b'q') => break,
            _ => {}
        }

        if let Err(e) = engine.check_health() {
            println!();
            eprintln!("Playback stalled: {}", e);
            break;
        }

        let stats = engine.stats();
        let state = match engine.state() {
            PlaybackState::Playing => "▶",
            PlaybackState::Paused => "⏸",
            PlaybackState::Stopped => "⏹",
        };
        let total = total_secs.unwrap_or(0.0);

        print!(
            "\r{} {:02}:{:05.2} / {:02}:{:05.2}  |  Refills: {}  |  Underruns: {}  ",
            state,
            (stats.position_secs / 60.0) as u32,
            stats.position_secs % 60.0,
            (total / 60.0) as u32,
            total % 60.0,
            stats.refills,
            stats.underruns
        );
        io::stdout().flush()?;

        std::thread::sleep(Duration::from_millis(50));
    }

    // 让最后一个 buffer 播完
    if engine.is_finished() {
        if let Some(session) = engine.session() {
            let bytes_per_second = session.format().bytes_per_second().max(1);
            let drain = session.buffer_size() as f64 / bytes_per_second as f64;
            std::thread::sleep(Duration::from_secs_f64(drain));
        }
    }

    println!("\n");
    let report = engine.report();
    engine.stop();
    print!("{}", report);

    Ok(())
}

/// 创建引擎配置
fn create_engine_config(cli: &Cli) -> EngineConfig {
    let channels = if cli.stereo_only {
        ChannelPolicy::StereoOnly
    } else {
        ChannelPolicy::Native { max_channels: 8 }
    };
    let reset = match cli.reset_mode {
        ResetArg::Stop => ResetMode::Stop,
        ResetArg::Pause => ResetMode::Pause,
    };
    let prime = match cli.prime {
        PrimeArg::Marker => PrimeMode::Marker,
        PrimeArg::Sync => PrimeMode::Synchronous,
    };

    EngineConfig {
        output: OutputConfig {
            frames_per_buffer: cli.frames_per_buffer,
            sample_rate: cli.sample_rate,
            lock_memory: cli.lock_memory,
        },
        backend: BackendCaps {
            channels,
            reset,
            prime,
            ..BackendCaps::default()
        },
    }
}
