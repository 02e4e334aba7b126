//! tus-server - resumable upload server
//!
//! Serves the tus 1.0.0 protocol over HTTP with uploads kept on local disk.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tus_server::logging;
use tus_server::metrics::server::MetricsServer;
use tus_server::{Config, FileStore, ProtocolHandler, TusServer, UploadRegistry};

/// tus-server - resumable uploads over HTTP
#[derive(Parser, Debug)]
#[command(name = "tus-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level or filter, overrides logging.level (e.g. debug, tus_server=trace)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    logging::init_subscriber(&config.logging)?;

    info!("Starting tus-server v{}", tus_server::VERSION);
    info!("Loaded configuration from {:?}", args.config);

    let store = FileStore::open(&config.storage.directory).await?;
    info!("Storing uploads in {:?}", store.root());

    let handler = ProtocolHandler::new(
        Arc::new(UploadRegistry::new()),
        Arc::new(store),
        config.server.base_path.clone(),
        config.tus.max_size,
    );

    let mut metrics_server = None;
    if config.metrics.enabled {
        let mut server = MetricsServer::new(format!("0.0.0.0:{}", config.metrics.port));
        match server.start().await {
            Ok(addr) => {
                info!("Metrics available at http://{}/metrics", addr);
                metrics_server = Some(server);
            }
            Err(e) => warn!("Metrics server disabled: {}", e),
        }
    }

    let server = TusServer::new(&config.server.address, handler).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down server"),
    }

    if let Some(mut server) = metrics_server {
        server.shutdown().await;
    }

    Ok(())
}
