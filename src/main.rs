//! `dealer` daemon
//!
//! Loads configuration, recovers the message cache and keeps delivering it
//! until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use dealer::DispatchClient;
use dealer::config::{Settings, load_config};
use dealer::topology::WsDirectory;
use dealer::transport::WsTransport;
use dealer::utils::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    if let Err(e) = run(settings).await {
        error!("dealer failed: {e}");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> dealer::Result<()> {
    let transport = Arc::new(WsTransport);
    let directory = Arc::new(WsDirectory::new(
        transport.clone(),
        settings.services.clone(),
        Duration::from_millis(settings.discovery.ping_timeout_ms),
    ));

    let client = DispatchClient::start(settings, transport, directory).await?;
    let restored = client.recover()?;
    info!(restored, "dealer running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for shutdown signal: {e}");
    }
    info!("Shutdown signal received. Exiting gracefully.");

    client.shutdown().await;
    Ok(())
}
