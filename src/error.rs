//! Crate-wide error types.
//!
//! Each module that can fail defines its own `thiserror` enum at its seam
//! (`RoomError`, `ProtocolError`, `ProviderError`, `ExtensionError`,
//! `TableError`); this module composes them into one top-level `Error` so
//! callers crossing module boundaries don't have to match on each variant
//! individually.

use crate::protocol::ProtocolError;
use crate::room::RoomError;
use crate::workspace::ExtensionError;
use crate::workspace::TableError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors collected from an aggregate-destroy path (extension chain teardown,
/// document binding teardown). Individual failures are reported together
/// rather than aborting the remaining destroys.
#[derive(Debug, Default)]
pub struct DestroyErrors {
    pub failures: Vec<(String, Error)>,
}

impl DestroyErrors {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn push(&mut self, key: impl Into<String>, err: Error) {
        self.failures.push((key.into(), err));
    }
}

impl std::fmt::Display for DestroyErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} destroy hook(s) failed: ", self.failures.len())?;
        for (i, (key, err)) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{key}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DestroyErrors {}
