//! Network simulator for Arbor sync testing
//!
//! Every message travels as an encoded frame through a per-direction link
//! queue. Delivery is driven by a logical clock: each frame gets a delivery
//! tick from the configured delay plus seeded jitter, clamped so a link
//! never reorders. Duplicates are injected right behind the original.

use std::collections::{BTreeMap, VecDeque};

use arbor_core::{ArborError, KeyPath, ObjectId, PeerId, Value, VersionId};
use arbor_runtime::Peer;
use arbor_wire::Frame;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Simulation errors
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Peer already added: {0}")]
    DuplicatePeer(PeerId),

    #[error("Peer {peer} rejected a message from {from}: {source}")]
    Handler {
        peer: PeerId,
        from: PeerId,
        #[source]
        source: ArborError,
    },

    #[error("Local edit on {peer} failed: {source}")]
    Edit {
        peer: PeerId,
        #[source]
        source: ArborError,
    },

    #[error(transparent)]
    Wire(#[from] ArborError),

    #[error("Network still busy after {0} deliveries")]
    StepLimit(u64),
}

pub type SimResult<T> = std::result::Result<T, SimError>;

/// Simulated network conditions
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Base delivery delay in ticks
    pub delivery_delay_ticks: u64,
    /// Extra random delay, uniform in `0..=jitter_ticks`
    pub jitter_ticks: u64,
    /// Chance that a frame is delivered twice (0.0 - 1.0)
    pub duplicate_prob: f64,
    /// RNG seed
    pub seed: u64,
    /// Delivery budget for [`SimNetwork::run_until_idle`]
    pub max_steps: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            delivery_delay_ticks: 1,
            jitter_ticks: 0,
            duplicate_prob: 0.0,
            seed: 0,
            max_steps: 100_000,
        }
    }
}

impl SimConfig {
    /// Jittery links that duplicate one frame in ten
    pub fn chaotic() -> Self {
        SimConfig {
            jitter_ticks: 5,
            duplicate_prob: 0.1,
            ..SimConfig::default()
        }
    }

    pub fn with_delivery_delay(mut self, ticks: u64) -> Self {
        self.delivery_delay_ticks = ticks;
        self
    }

    pub fn with_jitter(mut self, ticks: u64) -> Self {
        self.jitter_ticks = ticks;
        self
    }

    pub fn with_duplicate_prob(mut self, prob: f64) -> Self {
        self.duplicate_prob = prob;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps = steps;
        self
    }
}

/// Simulation counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub frames_sent: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub duplicates_injected: u64,
}

#[derive(Clone, Debug)]
struct InFlight {
    deliver_at: u64,
    bytes: Bytes,
}

/// Deterministic multi-peer network
pub struct SimNetwork {
    config: SimConfig,
    rng: StdRng,
    peers: BTreeMap<PeerId, Peer>,
    /// Frames in transit, keyed by (sender, receiver)
    links: BTreeMap<(PeerId, PeerId), VecDeque<InFlight>>,
    now: u64,
    stats: SimStats,
}

impl SimNetwork {
    pub fn new(config: SimConfig) -> Self {
        SimNetwork {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            peers: BTreeMap::new(),
            links: BTreeMap::new(),
            now: 0,
            stats: SimStats::default(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn add_peer(&mut self, peer: Peer) -> SimResult<()> {
        let id = peer.id().clone();
        if self.peers.contains_key(&id) {
            return Err(SimError::DuplicatePeer(id));
        }
        self.peers.insert(id, peer);
        Ok(())
    }

    pub fn peer(&self, id: &PeerId) -> SimResult<&Peer> {
        self.peers
            .get(id)
            .ok_or_else(|| SimError::UnknownPeer(id.clone()))
    }

    /// Run `f` against a peer, then queue whatever it sent
    pub fn with_peer<R>(&mut self, id: &PeerId, f: impl FnOnce(&mut Peer) -> R) -> SimResult<R> {
        let peer = self
            .peers
            .get_mut(id)
            .ok_or_else(|| SimError::UnknownPeer(id.clone()))?;
        let result = f(peer);
        self.flush(id)?;
        Ok(result)
    }

    /// Local edit on `peer`
    pub fn set(
        &mut self,
        peer: &PeerId,
        object: &ObjectId,
        path: KeyPath,
        value: Option<Value>,
    ) -> SimResult<VersionId> {
        self.with_peer(peer, |p| p.set(object, path, value))?
            .map_err(|source| SimError::Edit {
                peer: peer.clone(),
                source,
            })
    }

    /// All peer ids, sorted
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    /// Open a link; `initiator` sends the first hello
    pub fn connect(&mut self, initiator: &PeerId, responder: &PeerId) -> SimResult<()> {
        if !self.peers.contains_key(initiator) {
            return Err(SimError::UnknownPeer(initiator.clone()));
        }
        let initiator_id = initiator.clone();
        self.with_peer(responder, |p| p.accept(initiator_id))?;
        let responder_id = responder.clone();
        self.with_peer(initiator, |p| p.connect(responder_id))?;
        debug!(initiator = %initiator, responder = %responder, "sim link up");
        Ok(())
    }

    /// Tear a link down. Frames still in transit on it are lost.
    pub fn disconnect(&mut self, a: &PeerId, b: &PeerId) -> SimResult<()> {
        self.flush(a)?;
        self.flush(b)?;
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(queue) = self.links.remove(&key) {
                self.stats.frames_dropped += queue.len() as u64;
            }
        }

        let b_id = b.clone();
        self.with_peer(a, |p| p.disconnect(&b_id))?;
        let a_id = a.clone();
        self.with_peer(b, |p| p.disconnect(&a_id))?;
        debug!(a = %a, b = %b, "sim link down");
        Ok(())
    }

    /// Deliver the next frame. Returns false when nothing is in transit.
    pub fn step(&mut self) -> SimResult<bool> {
        self.deliver_next(None)
    }

    /// Deliver frames until none is left, bounded by `max_steps`.
    /// Returns the number of deliveries.
    pub fn run_until_idle(&mut self) -> SimResult<u64> {
        let mut steps = 0;
        while self.step()? {
            steps += 1;
            if steps > self.config.max_steps {
                return Err(SimError::StepLimit(self.config.max_steps));
            }
        }
        Ok(steps)
    }

    /// Deliver every frame due by `deadline`, then move the clock there
    pub fn run_until(&mut self, deadline: u64) -> SimResult<u64> {
        let mut steps = 0;
        while self.deliver_next(Some(deadline))? {
            steps += 1;
        }
        self.now = self.now.max(deadline);
        Ok(steps)
    }

    /// Current logical time
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Frames in transit
    pub fn in_flight(&self) -> usize {
        self.links.values().map(VecDeque::len).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0 && self.peers.values().all(|p| !p.has_outgoing())
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Materialized value of `object` on every peer
    pub fn views(&self, object: &ObjectId) -> BTreeMap<PeerId, Option<Value>> {
        self.peers
            .iter()
            .map(|(id, p)| (id.clone(), p.get(object).cloned()))
            .collect()
    }

    /// Every peer holds `object` and they all see the same value
    pub fn converged(&self, object: &ObjectId) -> bool {
        let mut views = self.peers.values().map(|p| p.get(object));
        match views.next() {
            None => true,
            Some(first) => first.is_some() && views.all(|v| v == first),
        }
    }

    fn deliver_next(&mut self, deadline: Option<u64>) -> SimResult<bool> {
        let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for id in &ids {
            self.flush(id)?;
        }

        let next = self
            .links
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|f| (f.deliver_at, key)))
            .filter(|(at, _)| deadline.map_or(true, |d| *at <= d))
            .min()
            .map(|(at, key)| (at, key.clone()));
        let Some((deliver_at, key)) = next else {
            return Ok(false);
        };
        let Some(frame) = self.links.get_mut(&key).and_then(VecDeque::pop_front) else {
            return Ok(false);
        };
        let (from, to) = key;

        self.now = self.now.max(deliver_at);
        let frame = Frame::decode(&frame.bytes)?;
        trace!(
            tick = self.now,
            from = %from,
            to = %to,
            kind = ?frame.message.kind(),
            "deliver"
        );

        let peer = self
            .peers
            .get_mut(&to)
            .ok_or_else(|| SimError::UnknownPeer(to.clone()))?;
        peer.handle(&frame.sender, frame.message)
            .map_err(|source| SimError::Handler {
                peer: to.clone(),
                from: from.clone(),
                source,
            })?;
        self.stats.frames_delivered += 1;
        self.flush(&to)?;
        Ok(true)
    }

    /// Move a peer's outbox onto its links
    fn flush(&mut self, id: &PeerId) -> SimResult<()> {
        let peer = self
            .peers
            .get_mut(id)
            .ok_or_else(|| SimError::UnknownPeer(id.clone()))?;
        for envelope in peer.drain_outgoing() {
            if !self.peers.contains_key(&envelope.to) {
                warn!(from = %id, to = %envelope.to, "dropping frame for unknown peer");
                self.stats.frames_dropped += 1;
                continue;
            }
            let bytes = Frame::new(id.clone(), envelope.message).encode()?;
            self.enqueue(id.clone(), envelope.to, bytes);
        }
        Ok(())
    }

    fn enqueue(&mut self, from: PeerId, to: PeerId, bytes: Bytes) {
        let jitter = if self.config.jitter_ticks > 0 {
            self.rng.gen_range(0..=self.config.jitter_ticks)
        } else {
            0
        };
        let duplicate =
            self.config.duplicate_prob > 0.0 && self.rng.gen::<f64>() < self.config.duplicate_prob;

        let queue = self.links.entry((from, to)).or_default();
        // Never overtake a frame already on the link
        let earliest = queue.back().map_or(0, |f| f.deliver_at);
        let deliver_at = (self.now + self.config.delivery_delay_ticks + jitter).max(earliest);

        if duplicate {
            queue.push_back(InFlight {
                deliver_at,
                bytes: bytes.clone(),
            });
            self.stats.duplicates_injected += 1;
        }
        queue.push_back(InFlight { deliver_at, bytes });
        self.stats.frames_sent += 1;
    }
}
