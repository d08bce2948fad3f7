//! Wire messages exchanged between sessions.
//!
//! Every frame is a JSON [`Envelope`]:
//!
//! ```text
//! { "type": "operation", "from": "<site>", "to": "<site>"?, "payload": ...,
//!   "timestamp": <ms>, "id": "<uuid>" }
//! ```
//!
//! The payload is kept as raw JSON in the envelope and decoded by `type` into
//! a typed [`Message`] only once the envelope has been addressed and
//! de-duplicated.

use crate::clock::VersionVector;
use crate::error::{CollabError, CollabResult};
use crate::operation::{CrdtState, Operation};
use crate::presence::{CollaborationUser, CursorPosition};
use crate::site::SiteId;
use serde::{Deserialize, Serialize};

/// Message type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Operation,
    Cursor,
    Join,
    Leave,
    SyncRequest,
    SyncResponse,
    Heartbeat,
}

/// Envelope wrapping every frame on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sending site
    pub from: SiteId,
    /// Addressee; absent for broadcasts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<SiteId>,
    /// Type-specific payload
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Sender wall clock (ms)
    pub timestamp: u64,
    /// Unique message id
    pub id: String,
}

impl Envelope {
    /// Wrap a message for sending.
    pub fn new(
        from: SiteId,
        to: Option<SiteId>,
        message: &Message,
        timestamp: u64,
    ) -> CollabResult<Self> {
        Ok(Self {
            message_type: message.message_type(),
            from,
            to,
            payload: message.to_payload()?,
            timestamp,
            id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Serialize to a JSON frame.
    pub fn encode(&self) -> CollabResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON frame.
    ///
    /// Unknown types and missing fields are reported as
    /// [`CollabError::MalformedMessage`].
    pub fn decode(frame: &str) -> CollabResult<Self> {
        serde_json::from_str(frame).map_err(|e| CollabError::MalformedMessage(e.to_string()))
    }

    /// Check if the envelope is a broadcast or addressed to `site`.
    pub fn is_for(&self, site: &SiteId) -> bool {
        self.to.as_ref().map_or(true, |to| to == site)
    }

    /// Check if the envelope is a broadcast.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Decode the payload according to the envelope type.
    pub fn message(&self) -> CollabResult<Message> {
        fn payload<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> CollabResult<T> {
            T::deserialize(value).map_err(|e| CollabError::MalformedMessage(e.to_string()))
        }

        let message = match self.message_type {
            MessageType::Operation => Message::Operation(payload(&self.payload)?),
            MessageType::Cursor => Message::Cursor(payload(&self.payload)?),
            MessageType::Join => Message::Join(payload(&self.payload)?),
            MessageType::Leave => Message::Leave(payload(&self.payload)?),
            MessageType::SyncRequest => Message::SyncRequest(payload(&self.payload)?),
            MessageType::SyncResponse => Message::SyncResponse(payload(&self.payload)?),
            MessageType::Heartbeat => Message::Heartbeat(payload(&self.payload)?),
        };
        Ok(message)
    }
}

/// Typed message payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A single CRDT operation
    Operation(Operation),
    /// The sender's cursor moved
    Cursor(CursorPosition),
    /// The sender joined (broadcast) or is announcing itself to a joiner
    Join(JoinPayload),
    /// The sender is leaving
    Leave(LeavePayload),
    /// The sender's contiguous version vector; asks for what it is missing
    SyncRequest(VersionVector),
    /// Answer to a join or sync request
    SyncResponse(SyncResponse),
    /// Liveness ping or its reply
    Heartbeat(HeartbeatPayload),
}

impl Message {
    /// The wire tag for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Operation(_) => MessageType::Operation,
            Message::Cursor(_) => MessageType::Cursor,
            Message::Join(_) => MessageType::Join,
            Message::Leave(_) => MessageType::Leave,
            Message::SyncRequest(_) => MessageType::SyncRequest,
            Message::SyncResponse(_) => MessageType::SyncResponse,
            Message::Heartbeat(_) => MessageType::Heartbeat,
        }
    }

    fn to_payload(&self) -> CollabResult<serde_json::Value> {
        let value = match self {
            Message::Operation(op) => serde_json::to_value(op)?,
            Message::Cursor(cursor) => serde_json::to_value(cursor)?,
            Message::Join(join) => serde_json::to_value(join)?,
            Message::Leave(leave) => serde_json::to_value(leave)?,
            Message::SyncRequest(vv) => serde_json::to_value(vv)?,
            Message::SyncResponse(response) => serde_json::to_value(response)?,
            Message::Heartbeat(heartbeat) => serde_json::to_value(heartbeat)?,
        };
        Ok(value)
    }
}

/// Payload of a `join` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub user: CollaborationUser,
    #[serde(default)]
    pub version_vector: VersionVector,
}

/// Payload of a `leave` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeavePayload {
    pub user: CollaborationUser,
}

/// Payload of a `sync-response` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncResponse {
    /// Full snapshot
    State { state: CrdtState },
    /// Operations the requester is missing, plus the responder's vector
    Delta {
        operations: Vec<Operation>,
        #[serde(rename = "versionVector")]
        version_vector: VersionVector,
    },
}

impl SyncResponse {
    /// Operations carried by the response, whatever its kind.
    pub fn operations(&self) -> &[Operation] {
        match self {
            SyncResponse::State { state } => &state.operations,
            SyncResponse::Delta { operations, .. } => operations,
        }
    }
}

/// Payload of a `heartbeat` message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// False for a ping, true for the answer
    #[serde(default)]
    pub reply: bool,
}
