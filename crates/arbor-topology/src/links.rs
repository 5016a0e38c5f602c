//! Peer links - live connections of one peer

use std::collections::BTreeSet;

use arbor_core::PeerId;

/// Whether a peer forwards traffic between its links
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RelayRole {
    /// Only talks for itself
    #[default]
    Leaf,
    /// Forwards versions, acks and handshake updates between its links
    Hub,
}

impl RelayRole {
    pub fn relays(self) -> bool {
        matches!(self, RelayRole::Hub)
    }
}

/// Connections of a single peer
#[derive(Clone, Debug, Default)]
pub struct PeerLinks {
    role: RelayRole,
    connected: BTreeSet<PeerId>,
}

impl PeerLinks {
    /// Create a new link table
    pub fn new(role: RelayRole) -> Self {
        PeerLinks {
            role,
            connected: BTreeSet::new(),
        }
    }

    pub fn role(&self) -> RelayRole {
        self.role
    }

    /// Add a link. Returns true if it was not already present.
    pub fn link(&mut self, peer: PeerId) -> bool {
        self.connected.insert(peer)
    }

    /// Drop a link. Returns true if it was present.
    pub fn unlink(&mut self, peer: &PeerId) -> bool {
        self.connected.remove(peer)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected.contains(peer)
    }

    /// Connected peers, sorted
    pub fn connected(&self) -> impl Iterator<Item = &PeerId> {
        self.connected.iter()
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }

    /// Connected peers other than those in `except`
    pub fn broadcast_targets(&self, except: &[&PeerId]) -> Vec<PeerId> {
        self.connected
            .iter()
            .filter(|p| !except.contains(p))
            .cloned()
            .collect()
    }

    /// Peers that traffic from `except` should be forwarded to. Empty unless
    /// this peer relays.
    pub fn relay_targets(&self, except: &[&PeerId]) -> Vec<PeerId> {
        if !self.role.relays() {
            return Vec::new();
        }
        self.broadcast_targets(except)
    }
}
