//! Exponential backoff schedule for the supervisor loop's retry sleeps.
//!
//! Grounded on `examples/harborgrid-justin-caddy/src/enterprise/collaboration/transport.rs`'s
//! `ReconnectStrategy::calculate_delay`, adapted to the fixed curve named in
//! the spec: `500ms * min(10, 1.1^retries)`.

use std::time::Duration;

const BASE: f64 = 500.0;
const GROWTH: f64 = 1.1;
const MAX_FACTOR: f64 = 10.0;

/// Delay before the next connection attempt, given the number of
/// consecutive failures already observed in the current token round.
pub fn delay_for(retries: u32) -> Duration {
    let factor = GROWTH.powi(retries as i32).min(MAX_FACTOR);
    Duration::from_millis((BASE * factor) as u64)
}
