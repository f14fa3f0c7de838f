//! Seatlink - seat-to-seat chat
//!
//! Finds nearby devices, pairs with one and opens a chat over a direct
//! session. This binary runs the terminal front end over LAN discovery.

use seatlink_core::LinkConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod console;
mod lan;

fn main() {
    // Initialize logging; stdout belongs to the chat
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting Seatlink");

    let config = match LinkConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(console::run(config)) {
        tracing::error!("Seatlink stopped: {}", e);
        std::process::exit(1);
    }
}
