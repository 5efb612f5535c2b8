//! lumen-grabd — entry point.
//!
//! ```text
//! lumen-grabd                        Run the capture daemon
//! lumen-grabd --screenshot           Capture one frame to a PNG and exit
//! lumen-grabd --config <path>        Load a custom config TOML
//! lumen-grabd --gen-config           Write the default config to stdout
//! ```
//!
//! CLI flags override values from the config file. Send SIGUSR1 to a
//! running daemon to log on-demand health counters.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lumen_grabd::config::GrabConfig;
use lumen_grabd::service::{GrabService, capture_screenshot};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "lumen-grabd", about = "DRM framebuffer grabber for ambient lighting")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "lumen-grabd.toml")]
    config: PathBuf,

    /// DRM device to capture from (overrides config).
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Lighting sink TCP address (overrides config).
    #[arg(short, long)]
    address: Option<String>,

    /// Target capture rate in frames per second (overrides config).
    #[arg(long)]
    fps: Option<u32>,

    /// Consecutive failures tolerated before fallback (overrides config).
    #[arg(long)]
    max_retries: Option<u32>,

    /// Sink connect/send timeout in milliseconds (overrides config).
    #[arg(long)]
    connection_timeout: Option<u64>,

    /// Diagnostic log file path (overrides config).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// System monitor sampling interval in milliseconds (overrides config).
    #[arg(long)]
    monitor_interval: Option<u64>,

    /// Capture a single frame, write it to a PNG, and exit.
    #[arg(long)]
    screenshot: bool,

    /// Output path for --screenshot.
    #[arg(long, default_value = "screenshot.png")]
    screenshot_path: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Verbose console logging.
    #[arg(short, long)]
    verbose: bool,
}

fn apply_overrides(config: &mut GrabConfig, cli: &Cli) {
    if let Some(device) = &cli.device {
        config.device.path = device.display().to_string();
    }
    if let Some(address) = &cli.address {
        config.sink.address = address.clone();
    }
    if let Some(fps) = cli.fps {
        config.capture.fps = fps;
    }
    if let Some(max_retries) = cli.max_retries {
        config.sink.max_retries = max_retries;
    }
    if let Some(timeout) = cli.connection_timeout {
        config.sink.connect_timeout_ms = timeout;
        config.sink.send_timeout_ms = timeout;
    }
    if let Some(log_file) = &cli.log_file {
        config.logging.diagnostic_log = log_file.display().to_string();
    }
    if let Some(interval) = cli.monitor_interval {
        config.monitor.interval_ms = interval;
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&GrabConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = GrabConfig::load(&cli.config);
    apply_overrides(&mut config, &cli);

    // Init tracing.
    let default_level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("lumen-grabd v{}", env!("CARGO_PKG_VERSION"));

    // --screenshot: one-shot capture.
    if cli.screenshot {
        if let Err(e) = capture_screenshot(&config, &cli.screenshot_path) {
            error!("screenshot failed: {e}");
            std::process::exit(1);
        }
        return Ok(());
    }

    info!("sink: {}", config.sink.address);
    info!("diagnostic log: {}", config.logging.diagnostic_log);

    let service = GrabService::new(config);
    let stop = service.stop_handle();

    // SIGINT / SIGTERM → graceful shutdown.
    tokio::spawn(async move {
        let term = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term => {}
        }
        info!("shutdown signal received");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    if let Err(e) = service.run().await {
        error!("fatal: {e}");
        std::process::exit(1);
    }

    Ok(())
}
