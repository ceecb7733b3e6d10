//! scalebench server binary.
//!
//! Binds the listening socket (walking to a nearby port if the requested one
//! is taken), starts the worker pool with the event loop on its dedicated
//! thread, and prints a throughput report every 20 seconds.

use scalebench::config::Config;
use scalebench::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        pool_size = config.pool_size,
        "Starting scalebench server"
    );

    let server = Server::bind(config.port, config.pool_size)?;
    println!("Server started on port: {}", server.port());

    server.run()?;
    Ok(())
}
