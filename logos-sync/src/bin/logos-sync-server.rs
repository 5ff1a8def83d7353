//! Standalone sync server.
//!
//! ```text
//! LOGOS_SYNC_BIND=0.0.0.0:9090 RUST_LOG=info logos-sync-server [bind-addr]
//! ```

use logos_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::from_env();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }
    log::info!(
        "Starting logos-sync on {} (max {} connections, heartbeat {}s/{}s)",
        config.bind_addr,
        config.max_connections,
        config.heartbeat_interval_secs,
        config.heartbeat_timeout_secs
    );

    let server = SyncServer::new(config);
    let hub = server.hub().clone();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            hub.shutdown().await;
        }
    }
}
