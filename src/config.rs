//! Server process configuration, loaded once at startup.
//!
//! Mirrors the teacher's direct-env-var style (no config-file crate is
//! introduced; the teacher doesn't use one either) plus a `clap` overlay for
//! the server binary's command line, matching how the teacher's other bins
//! (`cmd.rs`, `log.rs`) take their own arguments.

use std::time::Duration;

use clap::Parser;

/// Default sync port (§6.2).
pub const DEFAULT_PORT: u16 = 3913;

#[derive(Debug, Clone, Parser)]
#[command(name = "epicenter-sync-server", about = "CRDT room-relay sync server")]
pub struct ServerConfig {
    /// TCP port to listen on. Falls back to the PORT environment variable,
    /// then DEFAULT_PORT.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Milliseconds a room with zero members is kept alive before eviction.
    #[arg(long, env = "EVICTION_TIMEOUT_MS", default_value_t = 30_000)]
    pub eviction_timeout_ms: u64,
}

impl ServerConfig {
    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_millis(self.eviction_timeout_ms)
    }
}

/// Install a `tracing_subscriber` env-filter subscriber, defaulting to `info`
/// when `RUST_LOG` is unset — the same default the teacher's bins use.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}
