mod config;
mod control;
mod decoder;
mod delta;
mod filter;
mod pipeline;
mod recorder;
mod session;
mod stream;
mod view;

use clap::Parser;
use std::io::BufReader;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use control::Command;
use decoder::types::{DecodeResult, SessionKeys};
use filter::FilterEngine;
use pipeline::Pipeline;
use session::Session;
use stream::StreamConnection;

#[derive(Parser)]
#[command(name = "uplink-watch")]
#[command(about = "LoRaWAN gateway uplink stream monitor with per-router signal deltas")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// DevEui filter (any formatting, e.g. EB9BD6AC12B61EED)
    #[arg(short, long)]
    device: Option<String>,

    /// Stream-level router id filter
    #[arg(short, long)]
    router: Option<String>,

    /// Record from startup and write the CSV here on shutdown
    #[arg(long, value_name = "PATH")]
    record: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });

    if cli.device.is_some() {
        config.filter.device = cli.device;
    }
    if cli.router.is_some() {
        config.filter.router = cli.router;
    }
    if let Some(path) = cli.record {
        config.recorder.enabled = true;
        config.recorder.export_path = Some(path);
    }

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("uplink-watch v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");
    info!("LoRaWAN uplink stream monitor");
    info!("===========================================");

    let filter = FilterEngine::new(
        config.filter.device.as_deref(),
        config.filter.router.as_deref(),
        config.filter.router_match,
    );
    info!("Filters: {}", filter);

    // Decode service forwarding
    #[cfg(feature = "forward")]
    let (keys, forwarder): (Option<SessionKeys>, Option<decoder::DecodeForwarder>) =
        match &config.decoder {
            Some(decoder_config) => {
                let forwarder = decoder::DecodeForwarder::new(decoder_config)?;
                info!("Payload forwarding enabled ({})", decoder_config.url);
                (Some(decoder_config.session_keys()), Some(forwarder))
            }
            None => {
                info!("Decode service not configured, payloads are not forwarded");
                (None, None)
            }
        };

    #[cfg(not(feature = "forward"))]
    let keys: Option<SessionKeys> = {
        if config.decoder.is_some() {
            info!("Decoder config found but forward feature not enabled");
        }
        None
    };

    let mut pipeline = Pipeline::new(filter, keys);
    if config.recorder.enabled {
        pipeline.recorder_mut().start();
        info!("Recording started");
    }

    let (decode_tx, decode_rx) = mpsc::channel::<DecodeResult>(64);
    let (command_tx, command_rx) = mpsc::channel::<Command>(16);
    control::spawn_command_reader(BufReader::new(std::io::stdin()), command_tx)?;

    let session = Session::new(
        StreamConnection::new(config.stream.url.clone()),
        pipeline,
        config.view.router_contains.clone(),
        decode_tx,
    );
    #[cfg(feature = "forward")]
    let session = session.with_forwarder(forwarder);
    let mut session = session;

    session.connect().await;
    session.run(command_rx, decode_rx).await;
    info!(
        "Session ended ({} routers tracked)",
        session.pipeline().deltas().len()
    );

    if let Some(path) = &config.recorder.export_path {
        if let Err(e) = session.export(path).await {
            error!("Failed to export samples: {:#}", e);
        }
    }

    Ok(())
}

