//! Client-side sync provider: the supervisor loop that keeps a workspace's
//! CRDT doc connected to a room on the relay server.

pub mod backoff;
pub mod provider;
pub mod status;
pub mod token;

pub use provider::{ProviderError, SyncProvider, SyncProviderConfig};
pub use status::Status;
pub use token::TokenSource;
