//! KV helper: one typed, migrate-on-read value per named key, sharing a
//! single `kv` container (§6.3's reserved key format) the way
//! `Tables` shares one `table:{name}` container per table.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use yrs::{Doc, Map, MapRef, ReadTxn, Transact};

use super::tables::{RowStatus, TableError};

pub struct KvDef<T> {
    pub latest_version: u32,
    pub migrate: Arc<dyn Fn(Value) -> Value + Send + Sync>,
    pub validate: Arc<dyn Fn(&Value) -> Option<T> + Send + Sync>,
}

/// Shared container backing every `KvEntry` in a workspace.
#[derive(Clone)]
pub struct KvStore {
    doc: Arc<Doc>,
    container: MapRef,
}

impl KvStore {
    pub fn new(doc: Arc<Doc>) -> Self {
        let container = doc.get_or_insert_map("kv");
        Self { doc, container }
    }

    pub fn entry<T: Serialize + DeserializeOwned + Clone>(
        &self,
        key: &'static str,
        def: KvDef<T>,
    ) -> KvEntry<T> {
        KvEntry {
            doc: self.doc.clone(),
            container: self.container.clone(),
            key,
            def,
        }
    }
}

pub struct KvEntry<T> {
    doc: Arc<Doc>,
    container: MapRef,
    key: &'static str,
    def: KvDef<T>,
}

impl<T: Serialize + DeserializeOwned + Clone> KvEntry<T> {
    pub fn set(&self, value: &T) -> Result<(), TableError> {
        let mut raw =
            serde_json::to_value(value).map_err(|e| TableError::Serialize(e.to_string()))?;
        if let Value::Object(map) = &mut raw {
            map.insert("_v".to_string(), Value::from(self.def.latest_version));
        }
        let json =
            serde_json::to_string(&raw).map_err(|e| TableError::Serialize(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        self.container.insert(&mut txn, self.key, json);
        Ok(())
    }

    pub fn get(&self) -> RowStatus<T> {
        let txn = self.doc.transact();
        let Some(value) = self.container.get(&txn, self.key) else {
            return RowStatus::NotFound;
        };
        let Some(json) = as_json_string(&value) else {
            return RowStatus::Invalid(Value::Null);
        };
        let Ok(parsed) = serde_json::from_str::<Value>(&json) else {
            return RowStatus::Invalid(Value::Null);
        };
        let migrated = (self.def.migrate)(parsed);
        match (self.def.validate)(&migrated) {
            Some(row) => RowStatus::Valid(row),
            None => RowStatus::Invalid(migrated),
        }
    }

    pub fn delete(&self) {
        let mut txn = self.doc.transact_mut();
        self.container.remove(&mut txn, self.key);
    }

    pub fn has(&self) -> bool {
        let txn = self.doc.transact();
        self.container.contains(&txn, self.key)
    }

    pub fn observe(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Box<dyn std::any::Any + Send + Sync> {
        let key = self.key;
        let sub = self
            .container
            .observe(move |txn, event| {
                if event.keys(txn).contains_key(key) {
                    callback();
                }
            })
            .expect("map container supports observers");
        Box::new(sub)
    }
}

fn as_json_string(value: &yrs::Value) -> Option<String> {
    match value {
        yrs::Value::Any(yrs::Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}
