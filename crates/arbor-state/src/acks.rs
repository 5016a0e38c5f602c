//! Ack tracking - which peer is known to hold which version

use std::collections::{BTreeMap, BTreeSet};

use arbor_core::{PeerId, VersionId};
use serde::{Deserialize, Serialize};

/// Per-peer sets of acknowledged version ids for one object.
///
/// An entry (even an empty one) means the peer is known to hold the object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckTable(BTreeMap<PeerId, BTreeSet<VersionId>>);

impl AckTable {
    pub fn new() -> Self {
        AckTable::default()
    }

    /// Record that `peer` holds `version`. Returns true if the ack is new.
    pub fn ack(&mut self, peer: &PeerId, version: &VersionId) -> bool {
        self.0
            .entry(peer.clone())
            .or_default()
            .insert(version.clone())
    }

    pub fn has_acked(&self, peer: &PeerId, version: &VersionId) -> bool {
        self.0
            .get(peer)
            .map(|acked| acked.contains(version))
            .unwrap_or(false)
    }

    /// Acked by every member of `quorum`. A member without an entry has
    /// acked nothing.
    pub fn acked_by_all<'q, I>(&self, version: &VersionId, quorum: I) -> bool
    where
        I: IntoIterator<Item = &'q PeerId>,
    {
        quorum
            .into_iter()
            .all(|peer| self.has_acked(peer, version))
    }

    /// Whether `peer` is known to hold this object at all
    pub fn knows_peer(&self, peer: &PeerId) -> bool {
        self.0.contains_key(peer)
    }

    /// Create an empty entry for `peer` if none exists
    pub fn ensure_peer(&mut self, peer: &PeerId) {
        self.0.entry(peer.clone()).or_default();
    }

    /// Versions acked by `peer`
    pub fn acked(&self, peer: &PeerId) -> Option<&BTreeSet<VersionId>> {
        self.0.get(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.0.keys()
    }

    /// Union `other` into this table. Returns true if anything was added.
    pub fn merge(&mut self, other: &AckTable) -> bool {
        let mut changed = false;
        for (peer, versions) in &other.0 {
            let entry = self.0.entry(peer.clone()).or_insert_with(|| {
                changed = true;
                BTreeSet::new()
            });
            for version in versions {
                changed |= entry.insert(version.clone());
            }
        }
        changed
    }

    /// Forget acks for versions that no longer exist. Entries are kept.
    pub fn prune(&mut self, removed: &[VersionId]) {
        for acked in self.0.values_mut() {
            for version in removed {
                acked.remove(version);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::from(s)
    }

    fn version(s: &str) -> VersionId {
        VersionId::from(s)
    }

    #[test]
    fn test_ack_reports_novelty() {
        let mut acks = AckTable::new();
        assert!(acks.ack(&peer("a"), &version("v1")));
        assert!(!acks.ack(&peer("a"), &version("v1")));
        assert!(acks.has_acked(&peer("a"), &version("v1")));
        assert!(!acks.has_acked(&peer("b"), &version("v1")));
    }

    #[test]
    fn test_acked_by_all_treats_missing_entry_as_unacked() {
        let mut acks = AckTable::new();
        acks.ack(&peer("a"), &version("v1"));

        let quorum: BTreeSet<PeerId> = [peer("a"), peer("b")].into_iter().collect();
        assert!(!acks.acked_by_all(&version("v1"), &quorum));

        acks.ack(&peer("b"), &version("v1"));
        assert!(acks.acked_by_all(&version("v1"), &quorum));
    }

    #[test]
    fn test_merge_adds_entries_and_acks() {
        let mut local = AckTable::new();
        local.ack(&peer("a"), &version("v1"));

        let mut remote = AckTable::new();
        remote.ack(&peer("a"), &version("v2"));
        remote.ensure_peer(&peer("b"));

        assert!(local.merge(&remote));
        assert!(local.has_acked(&peer("a"), &version("v2")));
        assert!(local.knows_peer(&peer("b")));
        assert!(!local.merge(&remote));
    }

    #[test]
    fn test_prune_keeps_entries() {
        let mut acks = AckTable::new();
        acks.ack(&peer("a"), &version("v1"));
        acks.ack(&peer("a"), &version("v2"));

        acks.prune(&[version("v1")]);
        assert!(!acks.has_acked(&peer("a"), &version("v1")));
        assert!(acks.has_acked(&peer("a"), &version("v2")));

        acks.prune(&[version("v2")]);
        assert!(acks.knows_peer(&peer("a")));
        assert!(acks.acked(&peer("a")).unwrap().is_empty());
    }

    #[test]
    fn test_serializes_as_arrays() {
        let mut acks = AckTable::new();
        acks.ack(&peer("a"), &version("v2"));
        acks.ack(&peer("a"), &version("v1"));

        let json = serde_json::to_value(&acks).unwrap();
        assert_eq!(json, serde_json::json!({ "a": ["v1", "v2"] }));
    }
}
