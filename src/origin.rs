//! Transaction-origin sentinels shared by the provider and the document
//! binding layer (§9 "reserved origin sentinel").
//!
//! A CRDT update's `yrs::Origin` is the only signal an observer has for
//! telling a genuinely local edit apart from one the sync provider applied
//! on the remote's behalf, or one a document binding produced to bump
//! `updatedAt`. `Local` carries no wire tag — it's whatever's left once the
//! other two are ruled out.

use yrs::Origin;

const REMOTE_TAG: &[u8] = b"epicenter-sync:remote";
const AUTO_BUMP_TAG: &[u8] = b"epicenter-sync:auto-bump";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginTag {
    Local,
    Remote,
    AutoBump,
}

impl OriginTag {
    /// Classify an observed transaction origin.
    pub fn of(origin: Option<&Origin>) -> OriginTag {
        match origin {
            Some(o) if *o == remote_origin() => OriginTag::Remote,
            Some(o) if *o == auto_bump_origin() => OriginTag::AutoBump,
            _ => OriginTag::Local,
        }
    }
}

/// Origin stamped on a transaction that applies an update received from the
/// sync provider's socket.
pub fn remote_origin() -> Origin {
    Origin::from(REMOTE_TAG)
}

/// Origin stamped on a document binding's automatic `updatedAt` bump, so row
/// observers can distinguish it from a user-initiated row edit.
pub fn auto_bump_origin() -> Origin {
    Origin::from(AUTO_BUMP_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_tags_and_defaults_to_local() {
        assert_eq!(OriginTag::of(None), OriginTag::Local);
        assert_eq!(OriginTag::of(Some(&remote_origin())), OriginTag::Remote);
        assert_eq!(OriginTag::of(Some(&auto_bump_origin())), OriginTag::AutoBump);
    }
}
