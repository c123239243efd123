//! BPM Broker CLI
//!
//! Receives heart-rate datagrams from ESP32 sensors and streams them to
//! WebSocket subscribers.

use anyhow::Context;
use bpm_broker::{server, Config, VERSION};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bpm-broker")]
#[command(version = VERSION)]
#[command(about = "Real-time heart-rate broker for ESP32 pulse sensors", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker until Ctrl+C
    Serve(ServeArgs),

    /// Show the effective configuration
    Config {
        /// Configuration file to read instead of the default location
        #[arg(long)]
        config: Option<PathBuf>,

        /// Save the configuration to the default location
        #[arg(long)]
        write: bool,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Configuration file to read instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the UDP ingest socket binds to
    #[arg(long)]
    udp_host: Option<String>,

    /// UDP ingest port
    #[arg(long)]
    udp_port: Option<u16>,

    /// Address the WebSocket server binds to
    #[arg(long)]
    ws_host: Option<String>,

    /// WebSocket port
    #[arg(long)]
    ws_port: Option<u16>,

    /// Smoothing factor in (0, 1); higher follows new readings faster
    #[arg(long)]
    alpha: Option<f64>,

    /// Number of accepted readings kept per source
    #[arg(long)]
    history_length: Option<usize>,

    /// Lowest plausible BPM
    #[arg(long)]
    min_bpm: Option<f64>,

    /// Highest plausible BPM
    #[arg(long)]
    max_bpm: Option<f64>,

    /// Readings passed through unsmoothed after a reset
    #[arg(long)]
    startup_threshold: Option<u32>,

    /// Finger-absent readings tolerated before reporting no signal
    #[arg(long)]
    no_finger_threshold: Option<u32>,

    /// Forward raw readings without smoothing
    #[arg(long)]
    no_smoothing: bool,

    /// Log filter when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl ServeArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.udp_host {
            config.ingest.host = host.clone();
        }
        if let Some(port) = self.udp_port {
            config.ingest.port = port;
        }
        if let Some(host) = &self.ws_host {
            config.subscriber.host = host.clone();
        }
        if let Some(port) = self.ws_port {
            config.subscriber.port = port;
        }
        if let Some(alpha) = self.alpha {
            config.smoothing.alpha = alpha;
        }
        if let Some(length) = self.history_length {
            config.smoothing.history_length = length;
        }
        if let Some(min) = self.min_bpm {
            config.smoothing.min_bpm = min;
        }
        if let Some(max) = self.max_bpm {
            config.smoothing.max_bpm = max;
        }
        if let Some(threshold) = self.startup_threshold {
            config.smoothing.startup_threshold = threshold;
        }
        if let Some(threshold) = self.no_finger_threshold {
            config.no_finger_threshold = threshold;
        }
        if self.no_smoothing {
            config.smoothing.enabled = false;
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Config::load().context("Failed to load configuration"),
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => cmd_serve(args),
        Commands::Config { config, write } => cmd_config(config.as_deref(), write),
    }
}

fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    init_tracing(&args.log_level);

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    println!("BPM Broker v{VERSION}");
    println!();
    println!(
        "  Smoothing: {}",
        if config.smoothing.enabled {
            format!(
                "enabled (alpha {}, history {}, range {}-{} BPM, grace {})",
                config.smoothing.alpha,
                config.smoothing.history_length,
                config.smoothing.min_bpm,
                config.smoothing.max_bpm,
                config.smoothing.startup_threshold
            )
        } else {
            "disabled".to_string()
        }
    );
    println!("  No-finger threshold: {}", config.no_finger_threshold);

    let broker = server::run(config).await.context("Failed to start broker")?;

    println!("  UDP ingest: {}", broker.ingest_addr);
    println!("  WebSocket: ws://{}", broker.subscriber_addr);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!();
    println!("Shutting down...");
    let counters = broker.state().counters.clone();
    broker.shutdown().await;

    println!();
    println!("{}", counters.summary());
    Ok(())
}

fn cmd_config(path: Option<&Path>, write: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;

    println!("{}", serde_json::to_string_pretty(&config)?);

    if write {
        let saved = config.save().context("Failed to save configuration")?;
        println!();
        println!("Configuration saved to {}", saved.display());
    } else {
        println!();
        println!("Config file: {}", Config::config_path().display());
    }
    Ok(())
}
