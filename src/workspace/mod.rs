//! Client workspace: owns the CRDT document, its KV/awareness helpers, an
//! optional sync provider, and the installed extension chain (§4.4).
//!
//! Tables are created on demand by whoever needs them (extensions, the
//! embedding app) via `Workspace::table`, since each table's row type is
//! generic; the workspace itself only needs to own the one document they
//! all share.

pub mod awareness_helper;
pub mod batch;
pub mod document_binding;
pub mod extension;
pub mod kv;
pub mod tables;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use yrs::{Doc, TransactionMut};

pub use awareness_helper::AwarenessHelper;
pub use extension::{ExtensionChainBuilder, ExtensionError, ExtensionExports};
pub use kv::{KvDef, KvEntry, KvStore};
pub use tables::{RowStatus, TableDef, TableError, Tables};

use crate::client::{SyncProvider, SyncProviderConfig, TokenSource};
use crate::error::{DestroyErrors, Error};
use extension::InstalledExtensions;

pub struct WorkspaceConfig {
    pub id: String,
    /// Use an existing doc (e.g. one the room manager already owns in
    /// integrated mode) instead of creating a fresh one.
    pub doc: Option<Arc<Doc>>,
    pub provider_url: Option<String>,
    pub token: TokenSource,
}

impl WorkspaceConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            doc: None,
            provider_url: None,
            token: TokenSource::None,
        }
    }
}

pub struct Workspace {
    pub id: String,
    pub doc: Arc<Doc>,
    pub kv: KvStore,
    pub awareness: Arc<AwarenessHelper>,
    pub provider: Option<Arc<SyncProvider>>,
    pub exports: ExtensionExports,
    installed: AsyncMutex<InstalledExtensions>,
}

impl Workspace {
    pub async fn build(
        config: WorkspaceConfig,
        chain: ExtensionChainBuilder,
    ) -> Result<Arc<Self>, Error> {
        let doc = config.doc.unwrap_or_else(|| {
            Arc::new(Doc::with_options(yrs::Options {
                guid: config.id.clone().into(),
                ..Default::default()
            }))
        });
        let kv = KvStore::new(doc.clone());

        let provider = config.provider_url.map(|url| {
            SyncProvider::new(SyncProviderConfig {
                url,
                doc: doc.clone(),
                token: config.token,
                connect: true,
            })
        });

        let awareness = Arc::new(AwarenessHelper::new(provider.clone()));

        let installed = chain
            .build(config.id.clone(), doc.clone(), kv.clone(), awareness.clone())
            .await?;
        let exports = installed.exports.clone();

        Ok(Arc::new(Self {
            id: config.id,
            doc,
            kv,
            awareness,
            provider,
            exports,
            installed: AsyncMutex::new(installed),
        }))
    }

    pub fn table<T: Serialize + DeserializeOwned + Clone>(&self, def: TableDef<T>) -> Tables<T> {
        Tables::new(self.doc.clone(), def)
    }

    pub fn batch<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        batch::batch(&self.doc, f)
    }

    /// Runs every installed extension's `destroy` in LIFO order (continuing
    /// past individual failures), disconnects the sync provider if any, and
    /// drops the awareness state. The CRDT doc itself is released when the
    /// last `Arc<Workspace>` goes away.
    pub async fn destroy(&self) -> DestroyErrors {
        if let Some(provider) = &self.provider {
            provider.destroy();
        }
        self.installed.lock().await.destroy_all().await
    }
}
