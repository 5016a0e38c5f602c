//! Identity types for Arbor
//!
//! Peers and objects are named by their owners, so both are plain strings.
//! Version ids are generated locally and must never collide across peers:
//! random ids carry 128 bits, merge ids are content-addressed over their
//! parents.

use std::borrow::Borrow;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $debug:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[inline]
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($debug, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                $name(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                $name(id)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Peer identity - stable across connections
    PeerId,
    "Peer"
);

string_id!(
    /// Object identity - the name a synchronized object is shared under
    ObjectId,
    "Object"
);

string_id!(
    /// Version identity - unique within an object's history
    VersionId,
    "Version"
);

/// Prefix marking content-addressed merge versions
const MERGE_PREFIX: &str = "m";

/// Id shared by every peer's first version of an object
const GENESIS_ID: &str = "genesis";

impl VersionId {
    /// Root every peer creates before the first edit of an empty history.
    /// Concurrent first edits then share a parent and can be merged.
    pub fn genesis() -> Self {
        VersionId(GENESIS_ID.to_string())
    }

    pub fn is_genesis(&self) -> bool {
        self.0 == GENESIS_ID
    }

    /// Generate a fresh random version id (128 bits, 32 hex chars)
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let bits: u128 = rng.gen();
        VersionId(format!("{:032x}", bits))
    }

    /// Content-addressed id for a merge of `parents`.
    ///
    /// Parent order does not matter: two peers joining the same set of leaves
    /// derive the same id, so their merges dedupe on exchange.
    pub fn merge_of(parents: &[VersionId]) -> Self {
        let mut sorted: Vec<&str> = parents.iter().map(|p| p.as_str()).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut hasher = Sha256::new();
        for parent in sorted {
            hasher.update(parent.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();

        let mut id = String::with_capacity(MERGE_PREFIX.len() + 32);
        id.push_str(MERGE_PREFIX);
        for byte in &digest[..16] {
            id.push_str(&format!("{:02x}", byte));
        }
        VersionId(id)
    }
}
