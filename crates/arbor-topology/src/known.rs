//! Known peers - every identity ever observed

use std::collections::BTreeSet;

use arbor_core::PeerId;

/// Peers observed directly or learned through handshakes.
///
/// Never shrinks: a peer that disconnects still has to acknowledge history
/// before it can be collapsed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KnownPeers(BTreeSet<PeerId>);

impl KnownPeers {
    /// Create a set containing only `local`
    pub fn new(local: PeerId) -> Self {
        let mut peers = BTreeSet::new();
        peers.insert(local);
        KnownPeers(peers)
    }

    /// Returns true if the peer was not known yet
    pub fn insert(&mut self, peer: PeerId) -> bool {
        self.0.insert(peer)
    }

    /// Add every peer of `peers`. Returns true if any was new.
    pub fn merge<I>(&mut self, peers: I) -> bool
    where
        I: IntoIterator<Item = PeerId>,
    {
        let before = self.0.len();
        self.0.extend(peers);
        self.0.len() != before
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.0.contains(peer)
    }

    pub fn as_set(&self) -> &BTreeSet<PeerId> {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<PeerId> {
        self.0.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
