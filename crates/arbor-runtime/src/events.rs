//! Event subscriptions scoped to one peer

use std::fmt;

use arbor_core::{ObjectId, Patch, PeerId};

/// Something observable happened on a peer
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    /// The materialized value of an object changed
    Change(ObjectId),
    /// A local patch was applied
    Patch { object: ObjectId, patch: Patch },
    /// A handshake with a peer completed
    Connected(PeerId),
    /// A link was torn down
    Disconnected(PeerId),
}

/// What a subscriber wants to hear about
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Change(ObjectId),
    Patch(ObjectId),
    Connected,
    Disconnected,
    All,
}

impl Topic {
    pub fn matches(&self, event: &PeerEvent) -> bool {
        match (self, event) {
            (Topic::All, _) => true,
            (Topic::Change(want), PeerEvent::Change(got)) => want == got,
            (Topic::Patch(want), PeerEvent::Patch { object, .. }) => want == object,
            (Topic::Connected, PeerEvent::Connected(_)) => true,
            (Topic::Disconnected, PeerEvent::Disconnected(_)) => true,
            _ => false,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Event callback
pub type Callback = Box<dyn FnMut(&PeerEvent) + Send>;

struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    callback: Callback,
}

/// Subscription registry
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn subscribe(&mut self, topic: Topic, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions.push(Subscription {
            id,
            topic,
            callback,
        });
        id
    }

    /// Returns true if the subscription existed
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    /// Deliver to every matching subscriber, in subscription order
    pub fn emit(&mut self, event: &PeerEvent) {
        for sub in &mut self.subscriptions {
            if sub.topic.matches(event) {
                (sub.callback)(event);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
