//! Extension chain: ordered, typed-export installation with composed
//! `whenReady` and LIFO teardown (§4.4 "Extension chain semantics").
//!
//! No equivalent exists in the teacher repo; the "ordered chain of
//! factories with a typed exports map" shape is this spec's own design.
//! The LIFO-destroy-continues-past-failures pattern mirrors
//! `src/error.rs`'s `DestroyErrors` aggregate, which is itself grounded on
//! the teacher's own best-effort broadcast/cleanup style (never let one
//! failure abort the rest of a teardown).

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::warn;
use yrs::Doc;

use super::awareness_helper::AwarenessHelper;
use super::kv::KvStore;
use crate::error::{DestroyErrors, Error};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension '{0}' failed to become ready: {1}")]
    NotReady(String, String),
    #[error("extension '{0}' destroy failed: {1}")]
    DestroyFailed(String, String),
}

/// Typed exports published by extensions earlier in the chain, keyed by
/// their registration key.
#[derive(Clone, Default)]
pub struct ExtensionExports {
    entries: Arc<StdMutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>>,
}

impl ExtensionExports {
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    fn insert(&self, key: &'static str, value: Arc<dyn Any + Send + Sync>) {
        self.entries.lock().unwrap().insert(key, value);
    }
}

/// Everything a factory needs: workspace identity, the CRDT doc, the shared
/// KV/awareness helpers, the composed readiness of every prior extension,
/// and their typed exports so far.
pub struct ExtensionContext {
    pub workspace_id: String,
    pub doc: Arc<Doc>,
    pub kv: KvStore,
    pub awareness: Arc<AwarenessHelper>,
    pub when_ready: BoxFuture<()>,
    pub exports: ExtensionExports,
}

/// What a factory returns on electing to install. `None` from the factory
/// itself means "declined installation" (§4.4: "a factory may return void").
pub struct ExtensionInstance {
    pub exports: Box<dyn Any + Send + Sync>,
    pub when_ready: Option<BoxFuture<Result<(), ExtensionError>>>,
    pub destroy: Option<Box<dyn FnOnce() -> BoxFuture<Result<(), ExtensionError>> + Send>>,
}

/// Normalizes a partially-specified extension instance the way
/// `defineExtension` does in §4.4: missing `whenReady` is already-ready,
/// missing `destroy` is a no-op.
impl ExtensionInstance {
    pub fn new(exports: impl Any + Send + Sync) -> Self {
        Self {
            exports: Box::new(exports),
            when_ready: None,
            destroy: None,
        }
    }

    pub fn with_ready(mut self, when_ready: BoxFuture<Result<(), ExtensionError>>) -> Self {
        self.when_ready = Some(when_ready);
        self
    }

    pub fn with_destroy(
        mut self,
        destroy: impl FnOnce() -> BoxFuture<Result<(), ExtensionError>> + Send + 'static,
    ) -> Self {
        self.destroy = Some(Box::new(destroy));
        self
    }
}

pub type ExtensionFactory = Arc<
    dyn Fn(ExtensionContext) -> BoxFuture<Option<ExtensionInstance>> + Send + Sync,
>;

struct Installed {
    key: &'static str,
    destroy: Option<Box<dyn FnOnce() -> BoxFuture<Result<(), ExtensionError>> + Send>>,
}

/// Builds an ordered extension chain. `.with_extension` returns a new
/// builder, leaving the receiver untouched (§4.4: "branching is isolated").
#[derive(Clone, Default)]
pub struct ExtensionChainBuilder {
    entries: Vec<(&'static str, ExtensionFactory)>,
}

impl ExtensionChainBuilder {
    pub fn with_extension(&self, key: &'static str, factory: ExtensionFactory) -> Self {
        let mut entries = self.entries.clone();
        entries.push((key, factory));
        Self { entries }
    }

    /// Install every registered extension in order, awaiting each one's
    /// `whenReady` before moving to the next. A later extension's factory
    /// only runs once every prior extension is installed and ready, which
    /// satisfies the composed-`whenReady` contract without needing true
    /// concurrent readiness tracking.
    pub async fn build(
        self,
        workspace_id: String,
        doc: Arc<Doc>,
        kv: KvStore,
        awareness: Arc<AwarenessHelper>,
    ) -> Result<InstalledExtensions, Error> {
        let exports = ExtensionExports::default();
        let mut installed: Vec<Installed> = Vec::new();

        for (key, factory) in self.entries {
            let ctx = ExtensionContext {
                workspace_id: workspace_id.clone(),
                doc: doc.clone(),
                kv: kv.clone(),
                awareness: awareness.clone(),
                when_ready: Box::pin(async {}),
                exports: exports.clone(),
            };

            let Some(instance) = factory(ctx).await else {
                continue; // declined installation
            };

            if let Some(when_ready) = instance.when_ready {
                if let Err(e) = when_ready.await {
                    warn!(extension = key, error = %e, "extension failed to become ready, unwinding");
                    let teardown_errors = destroy_all_lifo(&mut installed).await;
                    if !teardown_errors.is_empty() {
                        warn!(%teardown_errors, "errors unwinding already-installed extensions");
                    }
                    return Err(Error::Extension(e));
                }
            }

            exports.insert(key, Arc::from(instance.exports));
            installed.push(Installed {
                key,
                destroy: instance.destroy,
            });
        }

        Ok(InstalledExtensions { installed, exports })
    }
}

/// The result of a successful chain build: the typed exports map plus
/// everything needed to tear the chain down again.
pub struct InstalledExtensions {
    installed: Vec<Installed>,
    pub exports: ExtensionExports,
}

impl InstalledExtensions {
    /// Run every installed extension's `destroy` in LIFO order, continuing
    /// past individual failures and aggregating them (§4.4).
    pub async fn destroy_all(&mut self) -> DestroyErrors {
        destroy_all_lifo(&mut self.installed).await
    }
}

async fn destroy_all_lifo(installed: &mut Vec<Installed>) -> DestroyErrors {
    let mut errors = DestroyErrors::default();
    while let Some(ext) = installed.pop() {
        if let Some(destroy) = ext.destroy {
            if let Err(e) = destroy().await {
                errors.push(ext.key, Error::Extension(e));
            }
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn workspace() -> (Arc<Doc>, KvStore, Arc<AwarenessHelper>) {
        let doc = Arc::new(Doc::new());
        let kv = KvStore::new(doc.clone());
        let awareness = Arc::new(AwarenessHelper::new(None));
        (doc, kv, awareness)
    }

    #[tokio::test]
    async fn declined_installation_is_skipped() {
        let (doc, kv, awareness) = workspace();
        let chain = ExtensionChainBuilder::default()
            .with_extension("noop", Arc::new(|_ctx| Box::pin(async { None })));

        let installed = chain
            .build("ws".into(), doc, kv, awareness)
            .await
            .unwrap();
        assert!(installed.exports.get::<()>("noop").is_none());
    }

    #[tokio::test]
    async fn later_extension_sees_earlier_exports() {
        let (doc, kv, awareness) = workspace();
        let chain = ExtensionChainBuilder::default()
            .with_extension(
                "a",
                Arc::new(|_ctx| {
                    Box::pin(async { Some(ExtensionInstance::new(42i32)) })
                }),
            )
            .with_extension(
                "b",
                Arc::new(|ctx| {
                    Box::pin(async move {
                        let seen = ctx.exports.get::<i32>("a").map(|v| *v);
                        Some(ExtensionInstance::new(seen))
                    })
                }),
            );

        let installed = chain.build("ws".into(), doc, kv, awareness).await.unwrap();
        let b_exports = installed.exports.get::<Option<i32>>("b").unwrap();
        assert_eq!(**b_exports, Some(42));
    }

    #[tokio::test]
    async fn destroy_runs_lifo_and_continues_past_failures() {
        let (doc, kv, awareness) = workspace();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let order_a = order.clone();
        let order_b = order.clone();
        let chain = ExtensionChainBuilder::default()
            .with_extension(
                "a",
                Arc::new(move |_ctx| {
                    let order = order_a.clone();
                    Box::pin(async move {
                        Some(
                            ExtensionInstance::new(())
                                .with_destroy(move || {
                                    Box::pin(async move {
                                        order.lock().unwrap().push("a");
                                        Err(ExtensionError::DestroyFailed(
                                            "a".into(),
                                            "boom".into(),
                                        ))
                                    })
                                }),
                        )
                    })
                }),
            )
            .with_extension(
                "b",
                Arc::new(move |_ctx| {
                    let order = order_b.clone();
                    Box::pin(async move {
                        Some(ExtensionInstance::new(()).with_destroy(move || {
                            Box::pin(async move {
                                order.lock().unwrap().push("b");
                                Ok(())
                            })
                        }))
                    })
                }),
            );

        let mut installed = chain.build("ws".into(), doc, kv, awareness).await.unwrap();
        let errors = installed.destroy_all().await;

        assert_eq!(*order.lock().unwrap(), vec!["b", "a"]); // LIFO
        assert_eq!(errors.failures.len(), 1);
    }

    #[tokio::test]
    async fn when_ready_failure_unwinds_already_installed() {
        let (doc, kv, awareness) = workspace();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let destroyed_clone = destroyed.clone();

        let chain = ExtensionChainBuilder::default()
            .with_extension(
                "a",
                Arc::new(move |_ctx| {
                    let destroyed = destroyed_clone.clone();
                    Box::pin(async move {
                        Some(ExtensionInstance::new(()).with_destroy(move || {
                            Box::pin(async move {
                                destroyed.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })
                        }))
                    })
                }),
            )
            .with_extension(
                "b",
                Arc::new(|_ctx| {
                    Box::pin(async {
                        Some(ExtensionInstance::new(()).with_ready(Box::pin(async {
                            Err(ExtensionError::NotReady("b".into(), "never".into()))
                        })))
                    })
                }),
            );

        let result = chain.build("ws".into(), doc, kv, awareness).await;
        assert!(result.is_err());
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
