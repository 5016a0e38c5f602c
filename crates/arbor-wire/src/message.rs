//! Protocol messages exchanged between peers

use std::collections::BTreeMap;

use arbor_core::{ObjectId, PeerId, VersionId, VersionInfo};
use arbor_state::{AckTable, SyncObject};
use serde::{Deserialize, Serialize};

/// Message kind, carried in the frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 0x01,
    HelloBack = 0x02,
    Version = 0x03,
    Ack = 0x04,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageKind::Hello),
            0x02 => Some(MessageKind::HelloBack),
            0x03 => Some(MessageKind::Version),
            0x04 => Some(MessageKind::Ack),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Versions one peer is missing for an object it already holds
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectCatchup {
    /// Parents before children
    pub versions: Vec<VersionInfo>,
    /// The sender's full ack table for the object
    pub peer_acks: AckTable,
}

/// Handshake payload, shared by `Hello` and `HelloBack`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub catchup: BTreeMap<ObjectId, ObjectCatchup>,
    /// Full snapshots of objects the receiver does not hold
    pub missing_objects: BTreeMap<ObjectId, SyncObject>,
    pub known_peers: Vec<PeerId>,
}

impl Hello {
    /// Nothing to catch up on and no snapshots
    pub fn is_empty(&self) -> bool {
        self.missing_objects.is_empty() && self.catchup.values().all(|c| c.versions.is_empty())
    }

    /// Total number of versions carried, snapshots included
    pub fn version_count(&self) -> usize {
        let catchup: usize = self.catchup.values().map(|c| c.versions.len()).sum();
        let snapshots: usize = self
            .missing_objects
            .values()
            .map(|o| o.history.len())
            .sum();
        catchup + snapshots
    }
}

/// Real-time push of a single version
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionPush {
    pub object_id: ObjectId,
    pub version: VersionInfo,
}

/// Acknowledgment that a peer stored a version
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAck {
    pub object_id: ObjectId,
    pub version: VersionId,
    /// Peer that stored the version when the ack is relayed; the frame
    /// sender otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acked_by: Option<PeerId>,
}

impl VersionAck {
    pub fn new(object_id: ObjectId, version: VersionId) -> Self {
        VersionAck {
            object_id,
            version,
            acked_by: None,
        }
    }

    /// Ack relayed on behalf of `origin`
    pub fn on_behalf_of(object_id: ObjectId, version: VersionId, origin: PeerId) -> Self {
        VersionAck {
            object_id,
            version,
            acked_by: Some(origin),
        }
    }

    /// Peer the ack is attributed to, given the peer it came from
    pub fn origin<'a>(&'a self, from: &'a PeerId) -> &'a PeerId {
        self.acked_by.as_ref().unwrap_or(from)
    }
}

/// Every message of the sync protocol
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    Hello(Hello),
    HelloBack(Hello),
    Version(VersionPush),
    Ack(VersionAck),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::HelloBack(_) => MessageKind::HelloBack,
            Message::Version(_) => MessageKind::Version,
            Message::Ack(_) => MessageKind::Ack,
        }
    }

    /// Object the message is about, for single-object messages
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            Message::Version(push) => Some(&push.object_id),
            Message::Ack(ack) => Some(&ack.object_id),
            Message::Hello(_) | Message::HelloBack(_) => None,
        }
    }
}
