mod server;

use anyhow::Result;
use tracing::info;

use nodesync_core::bootstrap::load_config;
use nodesync_core::logging::init_logging;

use crate::server::NodeSyncServer;

// One cooperative scheduler per server; worker slots are tasks on it
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = load_config()?;

    // 2. Initialize logging
    init_logging(&config.logging)?;

    info!("NodeSync server starting...");
    info!(
        workers = config.server.total_workers(),
        mode = ?config.services.mode,
        discovery = config.services.enable.discovery,
        udp_port = config.server.udp_port,
        "Server configuration"
    );

    // 3. Build the worker pool and run until a shutdown signal
    NodeSyncServer::new(config).start().await
}
