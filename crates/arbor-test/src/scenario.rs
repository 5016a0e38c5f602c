//! Scenario builder - wires a simulated network from a topology

use std::collections::BTreeMap;

use arbor_core::{ObjectId, PeerId, Value};
use arbor_runtime::{Peer, PeerConfig};
use arbor_topology::{RelayRole, Topology};

use crate::{SimConfig, SimNetwork, SimResult};

/// Test scenario builder
pub struct ScenarioBuilder {
    topology: Topology,
    sim: SimConfig,
    peer: PeerConfig,
    overrides: BTreeMap<PeerId, PeerConfig>,
    objects: Vec<(PeerId, ObjectId, Value)>,
}

impl ScenarioBuilder {
    pub fn new(topology: Topology) -> Self {
        ScenarioBuilder {
            topology,
            sim: SimConfig::default(),
            peer: PeerConfig::default(),
            overrides: BTreeMap::new(),
            objects: Vec::new(),
        }
    }

    /// Star with `hub` in the middle
    pub fn star(hub: &str, leaves: &[&str]) -> Self {
        Self::new(Topology::star(
            hub.into(),
            leaves.iter().map(|l| PeerId::from(*l)),
        ))
    }

    pub fn mesh(peers: &[&str]) -> Self {
        Self::new(Topology::mesh(peers.iter().map(|p| PeerId::from(*p))))
    }

    pub fn chain(peers: &[&str]) -> Self {
        Self::new(Topology::chain(peers.iter().map(|p| PeerId::from(*p))))
    }

    /// Set network conditions
    pub fn with_config(mut self, config: SimConfig) -> Self {
        self.sim = config;
        self
    }

    /// Base configuration for every peer. Roles still come from the
    /// topology.
    pub fn with_peer_config(mut self, config: PeerConfig) -> Self {
        self.peer = config;
        self
    }

    /// Configuration for one peer, used as is
    pub fn with_override(mut self, peer: &str, config: PeerConfig) -> Self {
        self.overrides.insert(peer.into(), config);
        self
    }

    /// Create `object` on `peer` before any link comes up
    pub fn seed_object(mut self, peer: &str, object: &str, base: Value) -> Self {
        self.objects.push((peer.into(), object.into(), base));
        self
    }

    /// Build the network with every link's handshake in flight
    pub fn build(self) -> SimResult<SimNetwork> {
        let mut sim = SimNetwork::new(self.sim.clone());

        for (i, id) in self.topology.peers().enumerate() {
            let config = match self.overrides.get(id) {
                Some(config) => config.clone(),
                None => {
                    let role = self.topology.role_of(id).unwrap_or(RelayRole::Leaf);
                    let seed = self.sim.seed.wrapping_mul(1_000_003).wrapping_add(i as u64);
                    self.peer.clone().with_role(role).with_rng_seed(seed)
                }
            };
            sim.add_peer(Peer::with_config(id.clone(), config))?;
        }

        for (peer, object, base) in self.objects {
            sim.with_peer(&peer, |p| p.insert_object(object, base))?;
        }

        for link in self.topology.links() {
            sim.connect(&link.initiator, &link.responder)?;
        }
        Ok(sim)
    }
}
