//! Batch: group multiple mutations into one CRDT transaction (§4.4).
//!
//! The `Tables`/`KvEntry` convenience methods each open their own short
//! transaction; `batch` is the escape hatch for callers that need several
//! writes to land as a single Yjs transaction (one update frame, one
//! `observe` firing) instead of one per call.

use yrs::{Doc, TransactionMut};

pub fn batch<F, R>(doc: &Doc, f: F) -> R
where
    F: FnOnce(&mut TransactionMut) -> R,
{
    use yrs::Transact;
    let mut txn = doc.transact_mut();
    f(&mut txn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Map, ReadTxn, Transact};

    #[test]
    fn batch_groups_writes_into_one_transaction() {
        let doc = Doc::new();
        let container = doc.get_or_insert_map("kv");

        batch(&doc, |txn| {
            container.insert(txn, "a", "1".to_string());
            container.insert(txn, "b", "2".to_string());
        });

        let txn = doc.transact();
        assert_eq!(container.len(&txn), 2);
    }
}
