//! Sync relay server entry point.
//!
//! `Room created: {id}` / `Room evicted: {id}` log lines (§6.2) are emitted
//! by `room::RoomManager` itself; this binary only wires up the listener,
//! config, and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use epicenter_sync::config::{init_tracing, ServerConfig};
use epicenter_sync::room::{RoomManager, RoomManagerConfig};
use epicenter_sync::server::{graceful_shutdown, router, wait_for_shutdown_signal};
use tracing::info;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_tracing();

    let config = ServerConfig::parse();
    let rooms = RoomManager::new(RoomManagerConfig {
        eviction_timeout: Some(config.eviction_timeout()),
        ..Default::default()
    });

    let app = router(rooms.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "sync server listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown_signal());

    server.await?;

    info!("draining sessions before shutdown");
    graceful_shutdown(rooms, Duration::from_millis(200)).await;
    info!("shutdown complete");
    Ok(())
}
