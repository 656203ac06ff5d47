use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vcap_stream::config::{self, AppConfig};
use vcap_stream::stream::{FrameMailbox, StreamServer};
use vcap_stream::video::{
    CaptureLoopConfig, CaptureState, SimulatedBackend, V4l2Backend, VideoCapturer,
};

/// Frame pacing of the `--simulate` device
const SIMULATED_FRAME_INTERVAL: Duration = Duration::from_millis(33);

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

/// vcap-stream command line arguments
#[derive(Parser, Debug)]
#[command(name = "vcap-stream")]
#[command(version, about = "Stream raw V4L2 frames to a TCP client", long_about = None)]
struct CliArgs {
    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capture device (overrides config)
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<IpAddr>,

    /// TCP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Use a simulated capture device instead of V4L2
    #[arg(long)]
    simulate: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting vcap-stream v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AppConfig::default(),
    };

    // Apply CLI argument overrides to config (only if explicitly specified)
    if let Some(device) = args.device.clone() {
        config.capture.device = device;
    }
    if let Some(address) = args.address {
        config.stream.bind_address = address;
    }
    if let Some(port) = args.port {
        config.stream.port = port;
    }
    config.validate()?;

    let session_config = config.to_session_config();
    let loop_config = CaptureLoopConfig {
        timeout_ms: config.capture.timeout_ms,
        stats_interval: Duration::from_secs(config.capture.stats_interval_secs),
    };

    let mailbox = Arc::new(FrameMailbox::new());
    let server = StreamServer::bind(config.stream.socket_addr(), mailbox.clone())
        .with_context(|| format!("Failed to bind {}", config.stream.socket_addr()))?;
    let connected = server.connected_flag();

    let capturer = VideoCapturer::new();
    let started = if args.simulate {
        tracing::info!("Using simulated capture device");
        let backend = SimulatedBackend::new().with_frame_interval(SIMULATED_FRAME_INTERVAL);
        capturer
            .start(backend, session_config, loop_config, mailbox.clone(), connected)
            .await
    } else {
        capturer
            .start(V4l2Backend, session_config, loop_config, mailbox.clone(), connected)
            .await
    };
    started.with_context(|| {
        format!(
            "Failed to start capture on {}",
            config.capture.device.display()
        )
    })?;

    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server.run(cancel.clone()));

    let mut capture_state = capturer.state_watch();
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
        _ = capture_state.wait_for(|s| *s == CaptureState::Error) => {
            tracing::error!("Capture failed, shutting down");
        }
    }

    cancel.cancel();
    mailbox.close();
    if let Err(e) = capturer.stop().await {
        tracing::warn!("Failed to stop capture: {}", e);
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Streaming server error: {}", e),
        Err(e) => tracing::error!("Streaming server task failed: {}", e),
    }

    let stats = capturer.stats();
    tracing::info!(
        "Shutdown complete: {} frames captured, {} published",
        stats.frames_captured,
        stats.frames_published
    );
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vcap_stream=error",
        LogLevel::Warn => "vcap_stream=warn",
        LogLevel::Info => "vcap_stream=info",
        LogLevel::Verbose => "vcap_stream=debug",
        LogLevel::Debug => "vcap_stream=debug,v4l2r=debug",
        LogLevel::Trace => "vcap_stream=trace,v4l2r=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
