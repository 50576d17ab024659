//! Epicenter sync: a CRDT room-relay server plus the client-side sync
//! provider and workspace/extension chain that talk to it.

pub mod awareness;
pub mod client;
pub mod config;
pub mod error;
pub mod origin;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod workspace;

pub use error::{Error, Result};
