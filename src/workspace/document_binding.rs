//! Document bindings: attach a secondary CRDT document to each row of a
//! table, with tag-matched document extensions and row-deletion cleanup
//! (§4.4 "Document bindings").

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use yrs::Doc;

use super::tables::Tables;
use crate::origin::{auto_bump_origin, OriginTag};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Implemented by table row types that carry a document binding, so the
/// binding can bump the row's timestamp without knowing its exact shape.
pub trait HasUpdatedAt {
    fn set_updated_at(&mut self, timestamp_ms: i64);
}

/// Implemented by table row types that carry a document binding's guid
/// column.
pub trait HasDocumentGuid {
    fn document_guid(&self) -> &str;
}

pub struct DocumentBindingDef {
    pub binding_name: &'static str,
    pub tags: Vec<String>,
}

/// What a document extension factory returns when it decides to install
/// itself for an opened document.
pub struct DocumentExtensionInstance {
    pub exports: Box<dyn std::any::Any + Send + Sync>,
    pub destroy: Option<Box<dyn FnOnce() + Send>>,
}

pub struct DocumentExtensionContext<'a> {
    pub guid: &'a str,
    pub doc: Arc<Doc>,
}

type DocumentExtensionFactory = Arc<
    dyn Fn(&DocumentExtensionContext) -> Option<DocumentExtensionInstance> + Send + Sync,
>;

struct RegisteredExtension {
    tags: Vec<String>,
    factory: DocumentExtensionFactory,
}

struct OpenEntry {
    doc: Arc<Doc>,
    extensions: Vec<DocumentExtensionInstance>,
    // Kept alive only to hold the content-bump update subscription open.
    _content_subscription: Box<dyn std::any::Any + Send + Sync>,
}

/// Row-to-secondary-doc binding for one table. `open`/`close`/`close_all`
/// manage the open set; extensions registered via `with_extension` fire on
/// `open` for any binding whose tags intersect theirs (or that declared no
/// tags at all, which makes them universal).
pub struct DocumentBinding<T> {
    def: DocumentBindingDef,
    table: Arc<Tables<T>>,
    extensions: Vec<RegisteredExtension>,
    open_docs: StdMutex<HashMap<String, OpenEntry>>,
    _deletion_observer: StdMutex<Option<Box<dyn std::any::Any + Send + Sync>>>,
}

impl<T> DocumentBinding<T>
where
    T: Serialize + DeserializeOwned + Clone + HasDocumentGuid + HasUpdatedAt + Send + Sync + 'static,
{
    pub fn new(
        def: DocumentBindingDef,
        table: Arc<Tables<T>>,
        extensions: Vec<(Vec<String>, DocumentExtensionFactory)>,
    ) -> Arc<Self> {
        let extensions = extensions
            .into_iter()
            .map(|(tags, factory)| RegisteredExtension { tags, factory })
            .collect();

        let binding = Arc::new(Self {
            def,
            table,
            extensions,
            open_docs: StdMutex::new(HashMap::new()),
            _deletion_observer: StdMutex::new(None),
        });

        let weak = Arc::downgrade(&binding);
        let observer = binding.table.observe_deletions(move |_row_id, raw_row| {
            let Some(binding) = weak.upgrade() else {
                return;
            };
            if let Ok(row) = serde_json::from_value::<T>(raw_row) {
                binding.on_row_deleted(row.document_guid());
            }
        });
        *binding._deletion_observer.lock().unwrap() = Some(observer);

        binding
    }

    fn tag_matches(&self, ext_tags: &[String]) -> bool {
        ext_tags.is_empty() || ext_tags.iter().any(|t| self.def.tags.contains(t))
    }

    /// Open (or return the already-open) secondary document for `guid`,
    /// running every tag-matching extension factory in registration order.
    /// Wires an update observer that bumps the owning row's `updatedAt`
    /// whenever the doc changes via a local (not remote, not already an
    /// auto-bump) transaction (§4.4 "Content-doc updatedAt bump").
    pub fn open(&self, guid: &str) -> Arc<Doc> {
        if let Some(entry) = self.open_docs.lock().unwrap().get(guid) {
            return entry.doc.clone();
        }

        let doc = Arc::new(Doc::with_options(yrs::Options {
            guid: guid.into(),
            ..Default::default()
        }));

        let mut instances = Vec::new();
        for ext in &self.extensions {
            if self.tag_matches(&ext.tags) {
                let ctx = DocumentExtensionContext {
                    guid,
                    doc: doc.clone(),
                };
                if let Some(instance) = (ext.factory)(&ctx) {
                    instances.push(instance);
                }
            }
        }

        let table = self.table.clone();
        let owned_guid = guid.to_string();
        let subscription = doc
            .observe_update_v1(move |txn, _event| {
                if OriginTag::of(txn.origin()) != OriginTag::Local {
                    return;
                }
                if let Some((row_id, mut row)) = table.find(|row| row.document_guid() == owned_guid)
                {
                    row.set_updated_at(now_ms());
                    let _ = table.set_with_origin(&row_id, &row, Some(auto_bump_origin()));
                }
            })
            .expect("doc supports update observers");

        self.open_docs.lock().unwrap().insert(
            guid.to_string(),
            OpenEntry {
                doc: doc.clone(),
                extensions: instances,
                _content_subscription: Box::new(subscription),
            },
        );
        doc
    }

    pub fn close(&self, guid: &str) {
        if let Some(entry) = self.open_docs.lock().unwrap().remove(guid) {
            for instance in entry.extensions {
                if let Some(destroy) = instance.destroy {
                    destroy();
                }
            }
        }
    }

    pub fn close_all(&self) {
        let guids: Vec<String> = self.open_docs.lock().unwrap().keys().cloned().collect();
        for guid in guids {
            self.close(&guid);
        }
    }

    pub fn is_open(&self, guid: &str) -> bool {
        self.open_docs.lock().unwrap().contains_key(guid)
    }

    /// Called when a row that owned an open secondary doc is observed
    /// deleted. Default behavior: close it. Override by not calling
    /// `DocumentBinding::new` directly and instead wrapping `on_row_deleted`
    /// — left as a straight method so a future custom-hook variant can
    /// override it without touching the observer wiring.
    fn on_row_deleted(&self, guid: &str) {
        self.close(guid);
    }

    /// Bump the row's `updatedAt` column through the same distinguished
    /// origin `open`'s automatic observer uses. Exposed for callers that
    /// touch a row's metadata directly rather than through the secondary
    /// doc (e.g. a rename that doesn't itself produce a doc update).
    pub fn bump_updated_at(&self, row_id: &str, timestamp_ms: i64) -> Result<(), super::tables::TableError> {
        match self.table.get(row_id) {
            super::tables::RowStatus::Valid(mut row) => {
                row.set_updated_at(timestamp_ms);
                self.table
                    .set_with_origin(row_id, &row, Some(auto_bump_origin()))
            }
            _ => Err(super::tables::TableError::NotFound(row_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::tables::TableDef;
    use serde::Deserialize;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use yrs::{Doc as YDoc, GetString, ReadTxn, Text, Transact};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Note {
        #[serde(default)]
        _v: u32,
        guid: String,
        #[serde(default)]
        updated_at: i64,
    }

    impl HasDocumentGuid for Note {
        fn document_guid(&self) -> &str {
            &self.guid
        }
    }

    impl HasUpdatedAt for Note {
        fn set_updated_at(&mut self, timestamp_ms: i64) {
            self.updated_at = timestamp_ms;
        }
    }

    fn def() -> TableDef<Note> {
        TableDef {
            name: "notes",
            latest_version: 1,
            migrate: StdArc::new(|v| v),
            validate: StdArc::new(|v| serde_json::from_value(v.clone()).ok()),
        }
    }

    fn new_binding(tags: Vec<String>) -> (StdArc<Tables<Note>>, StdArc<DocumentBinding<Note>>) {
        let doc = StdArc::new(YDoc::new());
        let table = StdArc::new(Tables::new(doc, def()));
        let binding_def = DocumentBindingDef {
            binding_name: "notes",
            tags,
        };
        let binding = DocumentBinding::new(binding_def, table.clone(), Vec::new());
        (table, binding)
    }

    #[test]
    fn open_is_idempotent_until_close() {
        let (table, binding) = new_binding(vec![]);
        table
            .set(
                "a",
                &Note {
                    _v: 1,
                    guid: "g1".into(),
                    updated_at: 0,
                },
            )
            .unwrap();

        let first = binding.open("g1");
        let second = binding.open("g1");
        assert!(Arc::ptr_eq(&first, &second));

        binding.close("g1");
        assert!(!binding.is_open("g1"));
    }

    #[test]
    fn tag_matching_selects_applicable_extensions() {
        let fired = StdArc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let universal: DocumentExtensionFactory = Arc::new(move |_ctx| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            None
        });

        let missed = StdArc::new(AtomicUsize::new(0));
        let missed_clone = missed.clone();
        let mismatched: DocumentExtensionFactory = Arc::new(move |_ctx| {
            missed_clone.fetch_add(1, Ordering::SeqCst);
            None
        });

        let doc = StdArc::new(YDoc::new());
        let table = StdArc::new(Tables::new(doc, def()));
        let binding = DocumentBinding::new(
            DocumentBindingDef {
                binding_name: "notes",
                tags: vec!["shared".into()],
            },
            table.clone(),
            vec![(vec![], universal), (vec!["other".into()], mismatched)],
        );
        table
            .set(
                "a",
                &Note {
                    _v: 1,
                    guid: "g1".into(),
                    updated_at: 0,
                },
            )
            .unwrap();
        binding.open("g1");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(missed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn row_deletion_closes_its_open_doc() {
        let (table, binding) = new_binding(vec![]);
        table
            .set(
                "a",
                &Note {
                    _v: 1,
                    guid: "g1".into(),
                    updated_at: 0,
                },
            )
            .unwrap();
        binding.open("g1");
        assert!(binding.is_open("g1"));

        table.delete("a");
        assert!(!binding.is_open("g1"));
    }

    #[test]
    fn local_content_edit_bumps_updated_at_but_remote_edit_does_not() {
        let (table, binding) = new_binding(vec![]);
        table
            .set(
                "a",
                &Note {
                    _v: 1,
                    guid: "g1".into(),
                    updated_at: 0,
                },
            )
            .unwrap();

        let doc = binding.open("g1");
        let text = doc.get_or_insert_text("body");
        {
            let mut txn = doc.transact_mut();
            text.push(&mut txn, "hello");
        }
        let bumped_at = match table.get("a") {
            super::super::tables::RowStatus::Valid(row) => {
                assert!(row.updated_at > 0);
                row.updated_at
            }
            other => panic!("expected valid row, got {other:?}"),
        };

        {
            let mut txn = doc.transact_mut_with(crate::origin::remote_origin());
            text.push(&mut txn, " world");
        }
        match table.get("a") {
            super::super::tables::RowStatus::Valid(row) => assert_eq!(row.updated_at, bumped_at),
            other => panic!("expected valid row, got {other:?}"),
        }

        let txn = doc.transact();
        assert_eq!(text.get_string(&txn), "hello world".to_string());
    }
}
