//! OKX Feed Client Main Entry Point
//!
//! Connects to the OKX public feed, subscribes to the configured channel and
//! runs until interrupted. Exits with 1 if the runtime or the client's
//! transport context cannot be created.

use okx_feed_client::{Config, FeedClient};
use tokio::sync::watch;

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    log::info!("Starting OKX feed client");

    // Load configuration
    let config = Config::load_or_default();
    config.log_config();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Runtime init failed: {}", e);
            std::process::exit(1);
        }
    };

    let mut client = match FeedClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            log::error!("Client init failed: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Interrupt received");
                    let _ = shutdown_tx.send(true);
                }
                Err(e) => {
                    log::error!("Failed to listen for interrupt: {}", e);
                    // Keep the sender alive so the loop is not shut down
                    std::future::pending::<()>().await;
                }
            }
        });

        client.run(shutdown_rx).await;
    });

    log::info!("Completed");
}
