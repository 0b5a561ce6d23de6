//! `map-router` executable.
//!
//! Loads configuration, the compression tables and the session keys, then
//! serves map clients until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, trace, warn};

use map_router::bus::{channel_bus, WorkerEndpoint};
use map_router::config::RouterConfig;
use map_router::core::codec::BitCodec;
use map_router::error::Result;
use map_router::protocol::StaticKeyProvider;
use map_router::router::Router;
use map_router::transport::shutdown_channel;
use map_router::utils::logging::init_logging;
use map_router::utils::metrics::{global_metrics_handle, init_metrics};

#[derive(Debug, Parser)]
#[command(name = "map-router", version, about = "UDP map transport router")]
struct Args {
    /// TOML configuration file; MAP_ROUTER_* environment variables are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TOML file with per-character session keys
    #[arg(short, long)]
    keys: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(args: &Args) -> Result<RouterConfig> {
    let config = match &args.config {
        Some(path) => RouterConfig::from_file(path)?,
        None => RouterConfig::from_env()?,
    };
    config.validate_strict()?;
    Ok(config)
}

/// Stand-in consumer for when no game-logic workers are attached.
async fn drain_bus(mut worker: WorkerEndpoint) {
    while let Some(received) = worker.recv().await {
        match received {
            Ok(packet) => trace!(
                client = %packet.client_addr,
                packet_type = packet.packet.packet_type,
                "Routed packet dropped, no worker attached"
            ),
            Err(e) => warn!(error = %e, "Undecodable bus frame"),
        }
    }
}

async fn serve(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    init_logging(&config.logging)?;
    init_metrics();

    let codec = BitCodec::load_dir(&config.codec.resource_path)?;
    info!(path = %config.codec.resource_path.display(), "Compression tables loaded");

    let keys = match &args.keys {
        Some(path) => StaticKeyProvider::load_file(path)?,
        None => {
            warn!("No key file given, every login will be rejected");
            StaticKeyProvider::new()
        }
    };
    info!(characters = keys.len(), "Session keys loaded");

    let (bus, worker, replies) = channel_bus(config.bus.channel_capacity, config.bus.format);
    tokio::spawn(drain_bus(worker));

    let router = Router::bind(
        config,
        codec,
        Arc::new(keys),
        Arc::new(bus),
        global_metrics_handle(),
    )
    .await?;

    let (_shutdown_tx, shutdown_rx) = shutdown_channel();
    Arc::new(router).run(Some(replies), shutdown_rx).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.print_config {
        println!("{}", RouterConfig::example_config());
        return ExitCode::SUCCESS;
    }

    match serve(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Router failed");
            eprintln!("map-router: {e}");
            ExitCode::FAILURE
        }
    }
}
