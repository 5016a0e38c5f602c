//! Peer - the sync protocol state machine of one replica
//!
//! A peer never talks to the network itself. Local calls and
//! [`Peer::handle`] mutate state and queue [`Envelope`]s, which the
//! embedding transport drains with [`Peer::pop_outgoing`]. Every handler
//! runs to completion; views are refreshed once at the end of it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use arbor_core::{
    check, ArborError, ArborResult, KeyPath, ObjectId, Patch, PeerId, Value, VersionId,
    VersionInfo,
};
use arbor_state::{
    find_collapse, find_settled_collapse, topological_order, FoldedVersions, PendingVersions,
    SyncObject,
};
use arbor_topology::{KnownPeers, PeerLinks};
use arbor_wire::{Hello, Message, ObjectCatchup, VersionAck, VersionPush};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace, warn};

use crate::{Callback, EventBus, PeerConfig, PeerEvent, SubscriptionId, Topic};

/// A message addressed to a peer
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub to: PeerId,
    pub message: Message,
}

#[derive(Clone, Debug, Default)]
pub struct PeerStats {
    pub messages_handled: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub local_edits: u64,
    pub versions_inserted: u64,
    pub duplicates_absorbed: u64,
    pub versions_parked: u64,
    pub versions_dropped: u64,
    pub merges_created: u64,
    pub collapses: u64,
    pub versions_collapsed: u64,
}

/// Outcome of offering a remote version to an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Accepted {
    Inserted,
    Duplicate,
    Parked,
}

/// What applying one handshake changed here
#[derive(Clone, Copy, Debug, Default)]
struct Applied {
    /// A peer, an object or a version was new
    learned: bool,
    /// An object was adopted from a snapshot
    adopted: bool,
    /// First sign that the sender holds an object we hold
    sender_holds: bool,
}

impl std::ops::BitOrAssign for Applied {
    fn bitor_assign(&mut self, other: Applied) {
        self.learned |= other.learned;
        self.adopted |= other.adopted;
        self.sender_holds |= other.sender_holds;
    }
}

/// One replica
pub struct Peer {
    id: PeerId,
    config: PeerConfig,
    objects: BTreeMap<ObjectId, SyncObject>,
    /// Cached materialized values
    views: BTreeMap<ObjectId, Value>,
    /// Objects whose view must be recomputed
    dirty: BTreeSet<ObjectId>,
    pending: BTreeMap<ObjectId, PendingVersions>,
    folded: BTreeMap<ObjectId, FoldedVersions>,
    links: PeerLinks,
    /// Objects sent as snapshots on the current link, per peer
    offered: BTreeMap<PeerId, BTreeSet<ObjectId>>,
    known: KnownPeers,
    outgoing: VecDeque<Envelope>,
    events: EventBus,
    rng: StdRng,
    stats: PeerStats,
}

impl Peer {
    /// Create a new peer with default configuration
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self::with_config(id, PeerConfig::default())
    }

    /// Create a new peer with custom configuration
    pub fn with_config(id: impl Into<PeerId>, config: PeerConfig) -> Self {
        let id = id.into();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Peer {
            links: PeerLinks::new(config.role),
            offered: BTreeMap::new(),
            known: KnownPeers::new(id.clone()),
            id,
            config,
            objects: BTreeMap::new(),
            views: BTreeMap::new(),
            dirty: BTreeSet::new(),
            pending: BTreeMap::new(),
            folded: BTreeMap::new(),
            outgoing: VecDeque::new(),
            events: EventBus::new(),
            rng,
            stats: PeerStats::default(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub fn links(&self) -> &PeerLinks {
        &self.links
    }

    pub fn known_peers(&self) -> &KnownPeers {
        &self.known
    }

    // ---- objects -------------------------------------------------------

    /// Seed an object. Returns false if it already exists.
    pub fn insert_object(&mut self, id: impl Into<ObjectId>, base: Value) -> bool {
        let id = id.into();
        if self.objects.contains_key(&id) {
            return false;
        }
        let mut object = SyncObject::new(base);
        object.peer_acks.ensure_peer(&self.id);
        self.objects.insert(id.clone(), object);
        self.dirty.insert(id);
        self.refresh_views();
        true
    }

    /// Current materialized value
    pub fn get(&self, id: &ObjectId) -> Option<&Value> {
        self.views.get(id)
    }

    /// Full internal state of an object
    pub fn raw(&self, id: &ObjectId) -> Option<&SyncObject> {
        self.objects.get(id)
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().cloned().collect()
    }

    /// Versions parked for an object
    pub fn pending_len(&self, id: &ObjectId) -> usize {
        self.pending.get(id).map(|p| p.len()).unwrap_or(0)
    }

    /// Apply a local edit. `None` deletes the path.
    pub fn set(
        &mut self,
        object_id: &ObjectId,
        path: KeyPath,
        value: Option<Value>,
    ) -> ArborResult<VersionId> {
        let patch = match value {
            Some(value) => Patch::set(path, value),
            None => Patch::delete(path),
        };

        let object = self
            .objects
            .get(object_id)
            .ok_or_else(|| ArborError::UnknownObject(object_id.clone()))?;
        match self.views.get(object_id) {
            Some(view) => check(view, &patch)?,
            None => check(&object.view(), &patch)?,
        }

        // Join concurrent branches first so the edit descends from all of them
        self.merge_leaves(object_id, &[])?;
        self.advance_latest(object_id);

        let id = VersionId::generate(&mut self.rng);
        let object = self
            .objects
            .get_mut(object_id)
            .ok_or_else(|| ArborError::UnknownObject(object_id.clone()))?;
        let mut created = Vec::with_capacity(2);
        if object.history.is_empty() {
            let genesis = VersionInfo::genesis();
            object.insert(genesis.clone())?;
            object.ack(&self.id, &genesis.id);
            created.push(genesis);
        }
        let parents: Vec<VersionId> = object.history.latest.iter().cloned().collect();
        let info = VersionInfo::new(id.clone(), parents, vec![patch.clone()]);
        object.insert(info.clone())?;
        object.history.set_latest(id.clone());
        object.ack(&self.id, &id);
        created.push(info);

        self.stats.local_edits += 1;
        self.dirty.insert(object_id.clone());
        debug!(peer = %self.id, object = %object_id, version = %id, "local edit");

        self.events.emit(&PeerEvent::Patch {
            object: object_id.clone(),
            patch,
        });
        for target in self.holders(object_id, self.links.broadcast_targets(&[])) {
            for version in &created {
                self.send(
                    target.clone(),
                    Message::Version(VersionPush {
                        object_id: object_id.clone(),
                        version: version.clone(),
                    }),
                );
            }
        }

        self.release_pending(object_id);
        self.collapse_object(object_id);
        self.refresh_views();
        Ok(id)
    }

    // ---- links ---------------------------------------------------------

    /// Open a link and start the handshake
    pub fn connect(&mut self, remote: PeerId) {
        self.links.link(remote.clone());
        self.known.insert(remote.clone());
        self.send_handshake(remote, true);
    }

    /// Responder side of [`Peer::connect`]
    pub fn accept(&mut self, remote: PeerId) {
        self.links.link(remote.clone());
        self.known.insert(remote);
    }

    /// Tear down a link. Returns false if there was none.
    pub fn disconnect(&mut self, remote: &PeerId) -> bool {
        if !self.links.unlink(remote) {
            return false;
        }
        self.offered.remove(remote);
        debug!(peer = %self.id, remote = %remote, "disconnected");
        self.events.emit(&PeerEvent::Disconnected(remote.clone()));
        true
    }

    // ---- events --------------------------------------------------------

    pub fn subscribe(&mut self, topic: Topic, callback: Callback) -> SubscriptionId {
        self.events.subscribe(topic, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // ---- outbox --------------------------------------------------------

    /// Get next outgoing message (if any)
    pub fn pop_outgoing(&mut self) -> Option<Envelope> {
        self.outgoing.pop_front()
    }

    /// Take every queued outgoing message
    pub fn drain_outgoing(&mut self) -> Vec<Envelope> {
        self.outgoing.drain(..).collect()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    // ---- inbound -------------------------------------------------------

    /// Handle one message from `from`
    pub fn handle(&mut self, from: &PeerId, message: Message) -> ArborResult<()> {
        self.stats.messages_handled += 1;
        let result = match message {
            Message::Hello(hello) => self.on_hello(from, hello, true),
            Message::HelloBack(hello) => self.on_hello(from, hello, false),
            Message::Version(push) => self.on_version(from, push),
            Message::Ack(ack) => self.on_ack(from, ack),
        };
        self.refresh_views();
        result
    }

    fn on_hello(&mut self, from: &PeerId, hello: Hello, reply: bool) -> ArborResult<()> {
        if let Some(unknown) = hello
            .catchup
            .keys()
            .find(|id| !self.objects.contains_key(*id) && !hello.missing_objects.contains_key(*id))
        {
            return Err(ArborError::UnknownObject(unknown.clone()));
        }

        debug!(
            peer = %self.id,
            from = %from,
            versions = hello.version_count(),
            reply,
            "applying handshake"
        );
        let mut applied = Applied {
            learned: self.known.insert(from.clone()),
            ..Applied::default()
        };
        applied.learned |= self.known.merge(hello.known_peers);

        for (object_id, snapshot) in hello.missing_objects {
            applied |= self.apply_snapshot(from, object_id, snapshot)?;
        }
        for (object_id, catchup) in hello.catchup {
            applied |= self.apply_catchup(from, &object_id, catchup)?;
        }

        let ids = self.ids();
        if reply {
            for id in &ids {
                self.merge_leaves(id, &[from])?;
            }
        }
        for id in &ids {
            self.advance_latest(id);
        }

        // A HelloBack is answered only when it first shows that the sender
        // holds an object. The catch-up carries what was held back before.
        if reply || applied.sender_holds {
            self.send_handshake(from.clone(), false);
        }

        // Let the rest of the network learn what the handshake brought.
        // Forwards are gated on something new, so this stops.
        let mut forward: BTreeSet<PeerId> = BTreeSet::new();
        if reply || applied.learned {
            forward.extend(self.links.relay_targets(&[from]));
        }
        if applied.adopted {
            forward.extend(self.links.broadcast_targets(&[from]));
        }
        for target in forward {
            self.send_handshake(target, false);
        }

        for id in &ids {
            self.collapse_object(id);
        }
        self.events.emit(&PeerEvent::Connected(from.clone()));
        Ok(())
    }

    fn on_version(&mut self, from: &PeerId, push: VersionPush) -> ArborResult<()> {
        let VersionPush { object_id, version } = push;
        let id = version.id.clone();

        let accepted = self.accept_version(from, &object_id, version.clone())?;
        if accepted == Accepted::Inserted {
            if let Some(object) = self.objects.get_mut(&object_id) {
                object.history.set_latest(id);
            }
            // Parents go out before the descendants they release
            self.relay_version(&object_id, &version, from);
            self.release_pending(&object_id);
        }

        self.collapse_object(&object_id);
        Ok(())
    }

    fn on_ack(&mut self, from: &PeerId, ack: VersionAck) -> ArborResult<()> {
        let origin = ack.origin(from).clone();
        let object = self
            .objects
            .get_mut(&ack.object_id)
            .ok_or_else(|| ArborError::UnknownObject(ack.object_id.clone()))?;

        if !object.ack(&origin, &ack.version) {
            trace!(peer = %self.id, version = %ack.version, origin = %origin, "ack already known");
            return Ok(());
        }
        self.known.insert(origin.clone());

        let targets = self.holders(&ack.object_id, self.links.relay_targets(&[from, &origin]));
        for target in targets {
            self.send(
                target,
                Message::Ack(VersionAck::on_behalf_of(
                    ack.object_id.clone(),
                    ack.version.clone(),
                    origin.clone(),
                )),
            );
        }

        self.collapse_object(&ack.object_id);
        Ok(())
    }

    // ---- handshake helpers ---------------------------------------------

    /// Send a `Hello` (or `HelloBack`) built for `target`, remembering which
    /// objects went out as snapshots
    fn send_handshake(&mut self, target: PeerId, initial: bool) {
        let hello = self.build_hello(&target);
        debug!(
            peer = %self.id,
            remote = %target,
            versions = hello.version_count(),
            initial,
            "sending hello"
        );
        if !hello.missing_objects.is_empty() && self.links.is_connected(&target) {
            self.offered
                .entry(target.clone())
                .or_default()
                .extend(hello.missing_objects.keys().cloned());
        }
        let message = if initial {
            Message::Hello(hello)
        } else {
            Message::HelloBack(hello)
        };
        self.send(target, message);
    }

    /// Whether `peer` holds `object_id`, or has it on the way in a snapshot
    fn holds(&self, peer: &PeerId, object_id: &ObjectId) -> bool {
        self.objects
            .get(object_id)
            .map_or(false, |object| object.peer_acks.knows_peer(peer))
            || self
                .offered
                .get(peer)
                .map_or(false, |offered| offered.contains(object_id))
    }

    /// Keep the targets that hold `object_id`. Any other peer gets the
    /// object from a handshake snapshot.
    fn holders(&self, object_id: &ObjectId, targets: Vec<PeerId>) -> Vec<PeerId> {
        targets
            .into_iter()
            .filter(|target| self.holds(target, object_id))
            .collect()
    }

    /// Pass a version from `from` on to relay targets, with its ack
    fn relay_version(&mut self, object_id: &ObjectId, version: &VersionInfo, from: &PeerId) {
        for target in self.holders(object_id, self.links.relay_targets(&[from])) {
            self.send(
                target.clone(),
                Message::Version(VersionPush {
                    object_id: object_id.clone(),
                    version: version.clone(),
                }),
            );
            self.send(
                target,
                Message::Ack(VersionAck::on_behalf_of(
                    object_id.clone(),
                    version.id.clone(),
                    from.clone(),
                )),
            );
        }
    }

    /// What `target` is missing, as far as our ack table knows
    fn build_hello(&self, target: &PeerId) -> Hello {
        let mut hello = Hello {
            known_peers: self.known.to_vec(),
            ..Hello::default()
        };
        for (id, object) in &self.objects {
            if object.peer_acks.knows_peer(target) {
                hello.catchup.insert(
                    id.clone(),
                    ObjectCatchup {
                        versions: object.unacked_by(target),
                        peer_acks: object.peer_acks.clone(),
                    },
                );
            } else {
                hello.missing_objects.insert(id.clone(), object.clone());
            }
        }
        hello
    }

    fn apply_snapshot(
        &mut self,
        from: &PeerId,
        object_id: ObjectId,
        snapshot: SyncObject,
    ) -> ArborResult<Applied> {
        let infos: Vec<VersionInfo> = topological_order(&snapshot.history)
            .into_iter()
            .map(|v| v.info())
            .collect();

        if self.objects.contains_key(&object_id) {
            // Already seeded here: treat the snapshot as catch-up, keep our base
            return self.apply_catchup(
                from,
                &object_id,
                ObjectCatchup {
                    versions: infos,
                    peer_acks: snapshot.peer_acks,
                },
            );
        }

        debug!(
            peer = %self.id,
            object = %object_id,
            versions = infos.len(),
            "adopting snapshot"
        );
        let mut object = snapshot;
        object.peer_acks.ensure_peer(&self.id);
        object.peer_acks.ensure_peer(from);
        for info in &infos {
            object.ack(&self.id, &info.id);
            object.ack(from, &info.id);
        }
        self.objects.insert(object_id.clone(), object);
        self.dirty.insert(object_id.clone());

        for info in infos {
            self.send(
                from.clone(),
                Message::Ack(VersionAck::new(object_id.clone(), info.id)),
            );
        }
        Ok(Applied {
            learned: true,
            adopted: true,
            sender_holds: false,
        })
    }

    fn apply_catchup(
        &mut self,
        from: &PeerId,
        object_id: &ObjectId,
        catchup: ObjectCatchup,
    ) -> ArborResult<Applied> {
        let mut applied = Applied::default();
        if let Some(object) = self.objects.get_mut(object_id) {
            // Whoever sends a catch-up holds the object
            if !object.peer_acks.knows_peer(from) {
                object.peer_acks.ensure_peer(from);
                applied.sender_holds = true;
            }
        }
        for info in catchup.versions {
            applied.learned |= self.accept_version(from, object_id, info)? == Accepted::Inserted;
        }
        if let Some(object) = self.objects.get_mut(object_id) {
            object.peer_acks.merge(&catchup.peer_acks);
        }
        self.release_pending(object_id);
        Ok(applied)
    }

    /// Join divergent leaves. The merge is pushed to every link except
    /// `except`.
    fn merge_leaves(&mut self, object_id: &ObjectId, except: &[&PeerId]) -> ArborResult<()> {
        let Some(object) = self.objects.get_mut(object_id) else {
            return Ok(());
        };
        let Some(merge) = object.merge_leaves()? else {
            return Ok(());
        };
        object.ack(&self.id, &merge.id);

        self.stats.merges_created += 1;
        self.dirty.insert(object_id.clone());
        debug!(
            peer = %self.id,
            object = %object_id,
            version = %merge.id,
            parents = merge.parents.len(),
            "merged leaves"
        );

        for target in self.holders(object_id, self.links.broadcast_targets(except)) {
            self.send(
                target,
                Message::Version(VersionPush {
                    object_id: object_id.clone(),
                    version: merge.clone(),
                }),
            );
        }
        self.release_pending(object_id);
        Ok(())
    }

    /// Move `latest` to the only leaf, if there is exactly one
    fn advance_latest(&mut self, object_id: &ObjectId) {
        let Some(object) = self.objects.get_mut(object_id) else {
            return;
        };
        let leaves = object.leaves();
        if let [leaf] = leaves.as_slice() {
            if object.history.latest.as_ref() != Some(leaf) {
                object.history.set_latest(leaf.clone());
            }
        }
    }

    // ---- versions ------------------------------------------------------

    /// Offer a remote version. The sender's ack is recorded either way.
    fn accept_version(
        &mut self,
        from: &PeerId,
        object_id: &ObjectId,
        info: VersionInfo,
    ) -> ArborResult<Accepted> {
        let object = self
            .objects
            .get_mut(object_id)
            .ok_or_else(|| ArborError::UnknownObject(object_id.clone()))?;
        let id = info.id.clone();
        let folded = self
            .folded
            .get(object_id)
            .map_or(false, |folded| folded.contains(&id));
        // An emptied history takes a fresh genesis
        let late_copy = folded && !(id.is_genesis() && object.history.is_empty());
        if late_copy && !object.history.contains(&id) {
            self.stats.duplicates_absorbed += 1;
            trace!(peer = %self.id, object = %object_id, version = %id, "copy of a collapsed version");
            self.send(
                from.clone(),
                Message::Ack(VersionAck::new(object_id.clone(), id)),
            );
            return Ok(Accepted::Duplicate);
        }
        object.ack(from, &id);

        match object.insert(info.clone()) {
            Ok(true) => {
                object.ack(&self.id, &id);
                self.stats.versions_inserted += 1;
                self.dirty.insert(object_id.clone());
                trace!(peer = %self.id, object = %object_id, version = %id, "version inserted");
                self.send(
                    from.clone(),
                    Message::Ack(VersionAck::new(object_id.clone(), id)),
                );
                Ok(Accepted::Inserted)
            }
            Ok(false) => {
                self.stats.duplicates_absorbed += 1;
                trace!(peer = %self.id, object = %object_id, version = %id, "duplicate version");
                self.send(
                    from.clone(),
                    Message::Ack(VersionAck::new(object_id.clone(), id)),
                );
                Ok(Accepted::Duplicate)
            }
            Err(err) if err.is_retryable() => {
                warn!(peer = %self.id, object = %object_id, version = %id, error = %err, "parking version");
                self.park(from, object_id, info);
                Ok(Accepted::Parked)
            }
            Err(err) => Err(err),
        }
    }

    fn park(&mut self, from: &PeerId, object_id: &ObjectId, info: VersionInfo) {
        let capacity = self.config.max_pending_versions;
        let pending = self
            .pending
            .entry(object_id.clone())
            .or_insert_with(|| PendingVersions::with_capacity(capacity));
        self.stats.versions_parked += 1;
        if pending.park(from.clone(), info).is_some() {
            self.stats.versions_dropped += 1;
        }
    }

    /// Insert every parked version whose preconditions now hold, relaying
    /// each one like a version that inserted on arrival
    fn release_pending(&mut self, object_id: &ObjectId) {
        // Acks go out after every released version is relayed, so no peer
        // hears of a child's ack ahead of the sibling it would fold past
        let mut acks = Vec::new();
        loop {
            let ready = match (self.pending.get_mut(object_id), self.objects.get(object_id)) {
                (Some(pending), Some(object)) => pending.release(&object.history),
                _ => break,
            };
            if ready.is_empty() {
                break;
            }

            for parked in ready {
                let Some(object) = self.objects.get_mut(object_id) else {
                    break;
                };
                let id = parked.info.id.clone();
                match object.insert(parked.info.clone()) {
                    Ok(true) => {
                        object.ack(&self.id, &id);
                        self.stats.versions_inserted += 1;
                        self.dirty.insert(object_id.clone());
                        debug!(peer = %self.id, object = %object_id, version = %id, "released parked version");
                        self.relay_version(object_id, &parked.info, &parked.from);
                        acks.push((parked.from, id));
                    }
                    Ok(false) => acks.push((parked.from, id)),
                    Err(err) => {
                        self.stats.versions_dropped += 1;
                        warn!(peer = %self.id, object = %object_id, version = %id, error = %err, "dropping parked version");
                    }
                }
            }
        }

        if acks.is_empty() {
            return;
        }
        for (from, id) in acks {
            self.send(from, Message::Ack(VersionAck::new(object_id.clone(), id)));
        }
        self.advance_latest(object_id);
    }

    // ---- collapse and views --------------------------------------------

    fn collapse_object(&mut self, object_id: &ObjectId) {
        if !self.config.collapse_history {
            return;
        }
        let Some(object) = self.objects.get_mut(object_id) else {
            return;
        };

        let quorum = self.known.as_set();
        let collapse = if self.config.settled_collapse {
            find_settled_collapse(object, quorum)
        } else {
            find_collapse(object, quorum)
        };
        let Some(collapse) = collapse else {
            return;
        };

        debug!(
            peer = %self.id,
            object = %object_id,
            removed = collapse.remove_versions.len(),
            new_root = ?collapse.new_root,
            "collapsing history"
        );
        object.apply_collapse(&collapse);
        self.folded
            .entry(object_id.clone())
            .or_default()
            .record(&collapse.remove_versions);
        self.stats.collapses += 1;
        self.stats.versions_collapsed += collapse.remove_versions.len() as u64;
        self.dirty.insert(object_id.clone());
        self.release_pending(object_id);
    }

    /// Recompute dirty views, emitting `Change` for those that differ
    fn refresh_views(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        for id in dirty {
            let Some(object) = self.objects.get(&id) else {
                continue;
            };
            let view = object.view();
            if self.views.get(&id) == Some(&view) {
                continue;
            }
            self.views.insert(id.clone(), view);
            self.events.emit(&PeerEvent::Change(id));
        }
    }

    fn send(&mut self, to: PeerId, message: Message) {
        if !self.links.is_connected(&to) {
            self.stats.messages_dropped += 1;
            trace!(peer = %self.id, to = %to, kind = ?message.kind(), "not connected, dropping");
            return;
        }
        self.stats.messages_sent += 1;
        self.outgoing.push_back(Envelope { to, message });
    }
}
