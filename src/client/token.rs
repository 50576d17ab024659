//! Token acquisition for the connect URL: a static token, a dynamic
//! `getToken` callback with caching, or none at all.
//!
//! The supervisor loop owns the only handle to this cache; callers elsewhere
//! never need to touch it directly, per §4.3's "single owner" rule.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token callback failed: {0}")]
    Callback(String),
}

/// How the provider should obtain a connection token, if any.
#[derive(Clone)]
pub enum TokenSource {
    None,
    Static(String),
    Dynamic(Arc<dyn Fn() -> BoxFuture<Result<String, TokenError>> + Send + Sync>),
}

impl Default for TokenSource {
    fn default() -> Self {
        TokenSource::None
    }
}

/// Wraps a `TokenSource` with the one-shot cache described in §4.3: a
/// dynamic token is fetched once and reused until `invalidate()` is called
/// (after `RETRIES_BEFORE_TOKEN_REFRESH` failed connection attempts).
pub struct TokenCache {
    source: TokenSource,
    cached: Option<String>,
}

impl TokenCache {
    pub fn new(source: TokenSource) -> Self {
        Self {
            source,
            cached: None,
        }
    }

    /// Return the token to use for the next connection attempt, fetching and
    /// caching a dynamic token if none is cached yet.
    pub async fn acquire(&mut self) -> Result<Option<String>, TokenError> {
        match &self.source {
            TokenSource::None => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Dynamic(get_token) => {
                if self.cached.is_none() {
                    self.cached = Some(get_token().await?);
                }
                Ok(self.cached.clone())
            }
        }
    }

    /// Force the next `acquire()` to refetch a dynamic token.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}
