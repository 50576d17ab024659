//! Awareness helper: typed per-field access over the workspace's local
//! presence record, plus the raw handle the sync provider needs (§4.4).

use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;

use crate::client::SyncProvider;

/// Local awareness state plus (optionally) the provider that broadcasts it
/// and reports remote peers' state. A workspace with no attached provider
/// still has a usable, purely-local awareness helper.
pub struct AwarenessHelper {
    local: StdMutex<Value>,
    provider: Option<Arc<SyncProvider>>,
}

impl AwarenessHelper {
    pub fn new(provider: Option<Arc<SyncProvider>>) -> Self {
        Self {
            local: StdMutex::new(Value::Object(Default::default())),
            provider,
        }
    }

    pub fn set_field(&self, field: &str, value: Value) {
        {
            let mut local = self.local.lock().unwrap();
            match &mut *local {
                Value::Object(map) => {
                    map.insert(field.to_string(), value);
                }
                _ => unreachable!("local awareness state is always an object"),
            }
        }
        self.publish();
    }

    pub fn get_field(&self, field: &str) -> Option<Value> {
        self.local.lock().unwrap().get(field).cloned()
    }

    pub fn clear_field(&self, field: &str) {
        if let Value::Object(map) = &mut *self.local.lock().unwrap() {
            map.remove(field);
        }
        self.publish();
    }

    fn publish(&self) {
        if let Some(provider) = &self.provider {
            let snapshot = self.local.lock().unwrap().clone();
            provider.set_local_awareness(Some(snapshot));
        }
    }

    /// The raw provider handle, for callers that need the full remote
    /// awareness snapshot rather than just this client's own fields.
    pub fn raw(&self) -> Option<Arc<SyncProvider>> {
        self.provider.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_set_get_and_clear_without_a_provider() {
        let awareness = AwarenessHelper::new(None);
        assert_eq!(awareness.get_field("cursor"), None);

        awareness.set_field("cursor", serde_json::json!(42));
        assert_eq!(awareness.get_field("cursor"), Some(serde_json::json!(42)));

        awareness.clear_field("cursor");
        assert_eq!(awareness.get_field("cursor"), None);
    }
}
