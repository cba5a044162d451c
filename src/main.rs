use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use one_cam::capture::virtual_device::FrameGenerator;
#[cfg(feature = "v4l2")]
use one_cam::capture::V4l2Device;
use one_cam::capture::{CaptureDevice, CaptureSession, FrameSink, SinkContext, VirtualDevice};
use one_cam::config::{self, AppConfig, DeviceBackend};
use one_cam::events::EventBus;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// One-Cam command line arguments
#[derive(Parser, Debug)]
#[command(name = "one-cam")]
#[command(version, about = "Run a camera capture session and report frame statistics", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capture width (overrides config)
    #[arg(long, value_name = "PIXELS")]
    width: Option<u32>,

    /// Capture height (overrides config)
    #[arg(long, value_name = "PIXELS")]
    height: Option<u32>,

    /// Frame rate (overrides config)
    #[arg(long, value_name = "FPS")]
    fps: Option<u32>,

    /// How long to capture before stopping
    #[arg(short = 's', long, value_name = "SECONDS", default_value_t = 5)]
    seconds: u64,

    /// Display rotation in degrees
    #[arg(short = 'r', long, value_name = "DEGREES")]
    rotation: Option<u32>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print final statistics as JSON
    #[arg(long)]
    json: bool,

    /// Emit log lines as JSON
    #[arg(long)]
    log_json: bool,
}

/// Sink that only counts what it receives
#[derive(Default)]
struct CountingSink {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl FrameSink for CountingSink {
    fn deliver_frame(&self, _data: &[u8], length: usize, _context: SinkContext) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(length as u64, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting One-Cam v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_or_default(args.config.as_deref())?;
    if let Some(width) = args.width {
        config.device.width = width;
    }
    if let Some(height) = args.height {
        config.device.height = height;
    }
    if let Some(fps) = args.fps {
        config.device.fps = fps;
    }
    config.validate()?;

    let events = Arc::new(EventBus::new());
    let mut event_rx = events.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => tracing::debug!(event = event.event_name(), "{:?}", event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Event logger lagged, {} events missed", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (device, mut generator) = open_device(&config)?;
    let sink = Arc::new(CountingSink::default());
    let session = CaptureSession::builder()
        .device(device)
        .descriptor(config.device.descriptor())
        .sink(sink.clone(), SinkContext(0))
        .settings(config.capture.clone())
        .events(events.clone())
        .build()?;

    if let Some(rotation) = args.rotation {
        session.set_rotation(rotation)?;
    }

    session.request_start(config.device.width, config.device.height, config.device.fps)?;
    tracing::info!(
        "Session {} is {}, capturing for {}s",
        session.id(),
        session.state(),
        args.seconds
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = ticker.tick() => session.process(),
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping capture");
                break;
            }
        }
    }

    // Device stop may block until the hardware drains
    let stopping = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.request_stop()).await? {
        tracing::warn!("Stop failed: {}", e);
    }
    let stats = session.stats();

    let detaching = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || detaching.detach()).await? {
        tracing::warn!("Release failed: {}", e);
    }
    if let Some(generator) = generator.as_mut() {
        generator.stop();
    }
    event_task.abort();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("frames delivered:     {}", stats.frames_delivered);
        println!("bytes delivered:      {}", sink.bytes.load(Ordering::Relaxed));
        println!("dropped (stopped):    {}", stats.frames_dropped_stopped);
        println!("dropped (size):       {}", stats.frames_dropped_size);
        println!("stale buffers:        {}", stats.stale_buffers);
        println!("buffer pool:          #{}", stats.pool_generation);
    }

    tracing::info!(
        "Capture finished, {} frames received",
        sink.frames.load(Ordering::Relaxed)
    );
    Ok(())
}

/// Open the configured capture backend
fn open_device(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn CaptureDevice>, Option<FrameGenerator>)> {
    match config.device.backend {
        DeviceBackend::Virtual => {
            let device = Arc::new(VirtualDevice::new(config.device.id.clone()));
            let generator = device.spawn_generator()?;
            Ok((device as Arc<dyn CaptureDevice>, Some(generator)))
        }
        #[cfg(feature = "v4l2")]
        DeviceBackend::V4l2 => {
            let device = V4l2Device::open(config.device.id.clone(), &config.device.path)?;
            Ok((Arc::new(device) as Arc<dyn CaptureDevice>, None))
        }
        #[cfg(not(feature = "v4l2"))]
        DeviceBackend::V4l2 => {
            anyhow::bail!("V4L2 backend requested but one-cam was built without the v4l2 feature")
        }
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "one_cam=error",
        LogLevel::Warn => "one_cam=warn",
        LogLevel::Info => "one_cam=info",
        LogLevel::Verbose => "one_cam=debug",
        LogLevel::Debug => "one_cam=debug,v4l=debug",
        LogLevel::Trace => "one_cam=trace,v4l=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
