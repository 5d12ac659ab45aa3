mod config;

use codesync_collab::CollabServer;
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting codesync relay...");

    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = CollabServer::new(config).run().await {
        error!("Relay server stopped: {e}");
        std::process::exit(1);
    }
}
