//! Topology - The wiring of a whole network
//!
//! Links are undirected: every link is one handshake and two directions of
//! traffic. Peers with more than one neighbour in a star or chain relay.

use std::collections::{BTreeMap, BTreeSet};

use arbor_core::PeerId;

use crate::RelayRole;

/// Undirected link between two peers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Link {
    /// Side that initiates the handshake
    pub initiator: PeerId,
    pub responder: PeerId,
}

impl Link {
    pub fn new(initiator: PeerId, responder: PeerId) -> Self {
        Link {
            initiator,
            responder,
        }
    }

    pub fn touches(&self, peer: &PeerId) -> bool {
        &self.initiator == peer || &self.responder == peer
    }
}

/// Peers, their roles and the links between them
#[derive(Debug, Clone, Default)]
pub struct Topology {
    roles: BTreeMap<PeerId, RelayRole>,
    links: Vec<Link>,
}

impl Topology {
    /// Create a new empty topology
    pub fn new() -> Self {
        Self::default()
    }

    /// Star - every leaf linked to a relaying hub. Leaves initiate.
    pub fn star(hub: PeerId, leaves: impl IntoIterator<Item = PeerId>) -> Self {
        let mut topology = Topology::new();
        topology.add_peer(hub.clone(), RelayRole::Hub);
        for leaf in leaves {
            topology.add_peer(leaf.clone(), RelayRole::Leaf);
            topology.add_link(Link::new(leaf, hub.clone()));
        }
        topology
    }

    /// Mesh - fully connected, nobody relays
    pub fn mesh(peers: impl IntoIterator<Item = PeerId>) -> Self {
        let mut topology = Topology::new();
        let peers: Vec<PeerId> = peers.into_iter().collect();
        for (i, peer) in peers.iter().enumerate() {
            topology.add_peer(peer.clone(), RelayRole::Leaf);
            for existing in &peers[..i] {
                topology.add_link(Link::new(peer.clone(), existing.clone()));
            }
        }
        topology
    }

    /// Chain - each peer linked to the next; interior peers relay
    pub fn chain(peers: impl IntoIterator<Item = PeerId>) -> Self {
        let mut topology = Topology::new();
        let peers: Vec<PeerId> = peers.into_iter().collect();
        for (i, peer) in peers.iter().enumerate() {
            let interior = i > 0 && i + 1 < peers.len();
            let role = if interior {
                RelayRole::Hub
            } else {
                RelayRole::Leaf
            };
            topology.add_peer(peer.clone(), role);
        }
        for pair in peers.windows(2) {
            topology.add_link(Link::new(pair[1].clone(), pair[0].clone()));
        }
        topology
    }

    /// Add a peer, or change the role of an existing one
    pub fn add_peer(&mut self, peer: PeerId, role: RelayRole) {
        self.roles.insert(peer, role);
    }

    /// Add a link, registering unknown endpoints as leaves
    pub fn add_link(&mut self, link: Link) {
        self.roles.entry(link.initiator.clone()).or_default();
        self.roles.entry(link.responder.clone()).or_default();
        if !self.links.contains(&link) {
            self.links.push(link);
        }
    }

    /// Remove a peer and all its links
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.roles.remove(peer);
        self.links.retain(|l| !l.touches(peer));
    }

    /// Role of `peer`, if it is part of the topology
    pub fn role_of(&self, peer: &PeerId) -> Option<RelayRole> {
        self.roles.get(peer).copied()
    }

    /// All peers, sorted
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.roles.keys()
    }

    /// Links in insertion order
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Peers linked to `peer`
    pub fn neighbors(&self, peer: &PeerId) -> BTreeSet<PeerId> {
        self.links
            .iter()
            .filter_map(|l| {
                if &l.initiator == peer {
                    Some(l.responder.clone())
                } else if &l.responder == peer {
                    Some(l.initiator.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Get peer count
    pub fn peer_count(&self) -> usize {
        self.roles.len()
    }

    /// Whether every peer can reach every other through links
    pub fn is_connected(&self) -> bool {
        let Some(first) = self.roles.keys().next() else {
            return true;
        };

        let mut seen: BTreeSet<PeerId> = BTreeSet::new();
        let mut stack = vec![first.clone()];
        while let Some(peer) = stack.pop() {
            if !seen.insert(peer.clone()) {
                continue;
            }
            stack.extend(self.neighbors(&peer).into_iter().filter(|n| !seen.contains(n)));
        }
        seen.len() == self.roles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(names: &[&str]) -> Vec<PeerId> {
        names.iter().map(|n| PeerId::from(*n)).collect()
    }

    #[test]
    fn test_star_topology() {
        let hub = PeerId::from("hub");
        let star = Topology::star(hub.clone(), peers(&["a", "b", "c"]));

        assert_eq!(star.peer_count(), 4);
        assert_eq!(star.links().len(), 3);
        assert_eq!(star.role_of(&hub), Some(RelayRole::Hub));
        assert_eq!(star.role_of(&"a".into()), Some(RelayRole::Leaf));
        assert_eq!(star.neighbors(&hub).len(), 3);
        assert!(star.is_connected());
    }

    #[test]
    fn test_mesh_topology() {
        let mesh = Topology::mesh(peers(&["a", "b", "c"]));

        assert_eq!(mesh.links().len(), 3);
        assert_eq!(mesh.neighbors(&"a".into()).len(), 2);
        assert!(mesh.peers().all(|p| mesh.role_of(p) == Some(RelayRole::Leaf)));
    }

    #[test]
    fn test_chain_interior_relays() {
        let chain = Topology::chain(peers(&["a", "b", "c", "d"]));

        assert_eq!(chain.links().len(), 3);
        assert_eq!(chain.role_of(&"a".into()), Some(RelayRole::Leaf));
        assert_eq!(chain.role_of(&"b".into()), Some(RelayRole::Hub));
        assert_eq!(chain.role_of(&"c".into()), Some(RelayRole::Hub));
        assert_eq!(chain.role_of(&"d".into()), Some(RelayRole::Leaf));
        assert!(chain.is_connected());
    }

    #[test]
    fn test_remove_peer_drops_links() {
        let mut star = Topology::star("hub".into(), peers(&["a", "b"]));
        star.remove_peer(&"hub".into());

        assert!(star.links().is_empty());
        assert!(!star.is_connected());
    }
}
