//! In-process transport
//!
//! Each peer lives behind a lock and is driven by its own tokio task, which
//! drains an unbounded inbox of encoded frames. Outgoing messages are encoded
//! and pushed into the receiver's inbox while the sender's lock is held, so
//! frames from one peer to another arrive in send order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{ArborError, ArborResult, KeyPath, ObjectId, PeerId, Value, VersionId};
use arbor_runtime::Peer;
use arbor_wire::Frame;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Transport configuration
#[derive(Clone, Debug, Default)]
pub struct TransportConfig {
    /// Pause before each delivery. Zero only yields to the scheduler.
    pub delivery_delay: Duration,
}

impl TransportConfig {
    pub fn with_delivery_delay(mut self, delay: Duration) -> Self {
        self.delivery_delay = delay;
        self
    }
}

/// Snapshot of transport counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub handler_errors: u64,
}

#[derive(Debug, Default)]
struct TransportCounters {
    frames_sent: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    handler_errors: AtomicU64,
}

impl TransportCounters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the network and every peer task
#[derive(Default)]
struct Shared {
    inboxes: RwLock<HashMap<PeerId, mpsc::UnboundedSender<Bytes>>>,
    in_flight: AtomicUsize,
    idle: Notify,
    counters: TransportCounters,
}

impl Shared {
    /// Encode and route everything `peer` has queued.
    ///
    /// Must be called with the peer's lock held.
    fn flush(&self, peer: &mut Peer) {
        while let Some(envelope) = peer.pop_outgoing() {
            let to = envelope.to;
            let frame = Frame::new(peer.id().clone(), envelope.message);
            let bytes = match frame.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(peer = %peer.id(), to = %to, error = %err, "failed to encode frame");
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let inboxes = self.inboxes.read();
            let Some(inbox) = inboxes.get(&to) else {
                warn!(peer = %peer.id(), to = %to, "no such peer, dropping frame");
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            if inbox.send(bytes).is_err() {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                self.finish_one();
                continue;
            }
            self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One frame left the network
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Shared access to one running peer
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    peer: Arc<Mutex<Peer>>,
    shared: Arc<Shared>,
}

impl PeerHandle {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Run `f` against the peer, then send whatever it queued
    pub fn with<R>(&self, f: impl FnOnce(&mut Peer) -> R) -> R {
        let mut peer = self.peer.lock();
        let result = f(&mut *peer);
        self.shared.flush(&mut peer);
        result
    }

    pub fn insert_object(&self, id: impl Into<ObjectId>, base: Value) -> bool {
        self.with(|peer| peer.insert_object(id, base))
    }

    pub fn set(
        &self,
        object: &ObjectId,
        path: KeyPath,
        value: Option<Value>,
    ) -> ArborResult<VersionId> {
        self.with(|peer| peer.set(object, path, value))
    }

    /// Copy of the current materialized value
    pub fn get(&self, object: &ObjectId) -> Option<Value> {
        self.peer.lock().get(object).cloned()
    }
}

/// A set of peers wired together in one process
pub struct LocalNetwork {
    config: TransportConfig,
    shared: Arc<Shared>,
    peers: BTreeMap<PeerId, PeerHandle>,
}

impl LocalNetwork {
    pub fn new(config: TransportConfig) -> Self {
        LocalNetwork {
            config,
            shared: Arc::new(Shared::default()),
            peers: BTreeMap::new(),
        }
    }

    /// Register a peer and start its task. Must be called from within a
    /// tokio runtime.
    pub fn spawn(&mut self, peer: Peer) -> ArborResult<PeerHandle> {
        let id = peer.id().clone();
        if self.peers.contains_key(&id) {
            return Err(ArborError::TransportError(format!(
                "peer {id} is already registered"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.inboxes.write().insert(id.clone(), tx);

        let handle = PeerHandle {
            id: id.clone(),
            peer: Arc::new(Mutex::new(peer)),
            shared: self.shared.clone(),
        };
        tokio::spawn(run_peer(handle.clone(), rx, self.config.delivery_delay));
        self.peers.insert(id.clone(), handle.clone());

        debug!(peer = %id, "peer task started");
        Ok(handle)
    }

    pub fn peer(&self, id: &PeerId) -> ArborResult<&PeerHandle> {
        self.peers
            .get(id)
            .ok_or_else(|| ArborError::PeerNotFound(id.clone()))
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerHandle> {
        self.peers.values()
    }

    /// Open a link; `initiator` sends the Hello
    pub fn connect(&self, initiator: &PeerId, responder: &PeerId) -> ArborResult<()> {
        let from = self.peer(initiator)?;
        let to = self.peer(responder)?;

        to.with(|peer| peer.accept(initiator.clone()));
        from.with(|peer| peer.connect(responder.clone()));
        Ok(())
    }

    /// Tear down a link on both ends
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) -> ArborResult<()> {
        let first = self.peer(a)?;
        let second = self.peer(b)?;

        first.with(|peer| peer.disconnect(b));
        second.with(|peer| peer.disconnect(a));
        Ok(())
    }

    /// Frames sent but not yet handled
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot()
    }

    /// Wait until no frame is in flight
    pub async fn settle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for LocalNetwork {
    fn drop(&mut self) {
        // Closing the inboxes ends every peer task
        self.shared.inboxes.write().clear();
    }
}

async fn run_peer(
    handle: PeerHandle,
    mut inbox: mpsc::UnboundedReceiver<Bytes>,
    delay: Duration,
) {
    let shared = handle.shared.clone();
    while let Some(bytes) = inbox.recv().await {
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        match Frame::decode(&bytes) {
            Ok(frame) => {
                let sender = frame.sender;
                let message = frame.message;
                match handle.with(|peer| peer.handle(&sender, message)) {
                    Ok(()) => {
                        shared.counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        shared.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(peer = %handle.id, from = %sender, error = %err, "handler failed");
                    }
                }
            }
            Err(err) => {
                shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %handle.id, error = %err, "undecodable frame");
            }
        }
        shared.finish_one();
    }
    debug!(peer = %handle.id, "inbox closed");
}
