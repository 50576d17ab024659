//! Transient presence state: cursors, selections, user metadata.
//!
//! Awareness is a map keyed by a transient client id to an arbitrary JSON
//! record of per-field values. Unlike the CRDT document it is not merged via
//! update diffs — the latest value per client wins, and a client id maps to
//! `None` to signal its removal (mirroring the `y-protocols/awareness` wire
//! shape, see `other_examples/75a423cf_cloudillo-cloudillo-rs`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type ClientId = u64;

/// A single client's awareness update, as carried inside an `AWARENESS`
/// frame's payload. `None` removes the client's entry (disconnect, or an
/// explicit clear).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub client_id: ClientId,
    pub state: Option<serde_json::Value>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("AwarenessUpdate is always serializable")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Full snapshot of all known clients' awareness state, sent in response to
/// `QUERY_AWARENESS` and on initial connect.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwarenessSnapshot {
    pub clients: HashMap<ClientId, serde_json::Value>,
}

impl AwarenessSnapshot {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("AwarenessSnapshot is always serializable")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Server- or client-held awareness state for one room/workspace.
///
/// Not persisted, not replicated through the CRDT update channel — a room is
/// free to drop this on eviction with no durability concerns.
#[derive(Debug, Default)]
pub struct Awareness {
    clients: HashMap<ClientId, serde_json::Value>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: AwarenessSnapshot) -> Self {
        Self {
            clients: snapshot.clients,
        }
    }

    /// Apply an update, tolerating reordering and redundant removals.
    pub fn apply(&mut self, update: &AwarenessUpdate) {
        match &update.state {
            Some(value) => {
                self.clients.insert(update.client_id, value.clone());
            }
            None => {
                self.clients.remove(&update.client_id);
            }
        }
    }

    pub fn remove(&mut self, client_id: ClientId) -> bool {
        self.clients.remove(&client_id).is_some()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&serde_json::Value> {
        self.clients.get(&client_id)
    }

    pub fn snapshot(&self) -> AwarenessSnapshot {
        AwarenessSnapshot {
            clients: self.clients.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_sets_and_clears() {
        let mut aw = Awareness::new();
        aw.apply(&AwarenessUpdate {
            client_id: 1,
            state: Some(serde_json::json!({"cursor": 3})),
        });
        assert_eq!(aw.len(), 1);
        assert_eq!(aw.get(1).unwrap()["cursor"], 3);

        aw.apply(&AwarenessUpdate {
            client_id: 1,
            state: None,
        });
        assert!(aw.is_empty());
    }

    #[test]
    fn redundant_removal_is_a_no_op() {
        let mut aw = Awareness::new();
        aw.apply(&AwarenessUpdate {
            client_id: 7,
            state: None,
        });
        assert!(aw.is_empty());
        aw.apply(&AwarenessUpdate {
            client_id: 7,
            state: None,
        });
        assert!(aw.is_empty());
    }

    #[test]
    fn snapshot_roundtrips() {
        let mut aw = Awareness::new();
        aw.apply(&AwarenessUpdate {
            client_id: 42,
            state: Some(serde_json::json!({"name": "a"})),
        });
        let snap = aw.snapshot();
        let bytes = snap.encode();
        let decoded = AwarenessSnapshot::decode(&bytes).unwrap();
        assert_eq!(decoded, snap);
    }
}
