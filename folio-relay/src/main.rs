//! Folio relay: the pub/sub channel server collaborating editors connect to.
//!
//! Configured from the environment (`FOLIO_RELAY_ADDR`,
//! `FOLIO_RELAY_CAPACITY`, `FOLIO_RELAY_MAX_MEMBERS`); log level from
//! `RUST_LOG`.

use log::{error, info};

use folio_collab::server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting Folio relay on {} (capacity {}, max {} members per channel)",
        config.bind_addr, config.broadcast_capacity, config.max_members_per_channel
    );

    if let Err(e) = RelayServer::new(config).run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
