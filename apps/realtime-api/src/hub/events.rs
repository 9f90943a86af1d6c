//! Hub opcodes, domain events, and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_CLOSING: u8 = 7;
pub const OP_CALL_INVITE: u8 = 10;
pub const OP_CALL_ANSWER: u8 = 11;
pub const OP_CALL_SIGNAL: u8 = 12;
pub const OP_CALL_HANGUP: u8 = 13;

// ---------------------------------------------------------------------------
// Domain event (producer → hub)
// ---------------------------------------------------------------------------

/// Who an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User(String),
    Broadcast,
}

/// An event handed to a hub by a producer. Shared by `Arc` during fan-out.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: String,
    pub target: Target,
    pub payload: Value,
}

impl Event {
    pub fn to_user(kind: &str, user_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            target: Target::User(user_id.into()),
            payload,
        }
    }

    pub fn broadcast(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            target: Target::Broadcast,
            payload,
        }
    }

    /// Wire form of this event.
    pub fn to_message(&self) -> HubMessage {
        HubMessage::dispatch(&self.kind, self.payload.clone())
    }
}

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct HubMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    pub d: Value,
}

impl HubMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            d: data,
        }
    }

    /// Build a CLOSING message (op=7) asking the client to disconnect.
    pub fn closing(reason: &str) -> Self {
        Self {
            op: OP_CLOSING,
            t: None,
            d: serde_json::json!({ "reason": reason }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A data frame received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct CallInvitePayload {
    pub callee_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CallAnswerPayload {
    pub call_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CallSignalPayload {
    pub call_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct CallHangupPayload {
    pub call_id: String,
}

// ---------------------------------------------------------------------------
// Dispatch event types
// ---------------------------------------------------------------------------

/// Event names dispatched to clients by the hub itself.
pub struct EventName;

impl EventName {
    pub const CALL_INVITE: &'static str = "CALL_INVITE";
    pub const CALL_RINGING: &'static str = "CALL_RINGING";
    pub const CALL_ACCEPTED: &'static str = "CALL_ACCEPTED";
    pub const CALL_SIGNAL: &'static str = "CALL_SIGNAL";
    pub const CALL_ENDED: &'static str = "CALL_ENDED";
    pub const CALL_TIMEOUT: &'static str = "CALL_TIMEOUT";
    pub const CALL_ERROR: &'static str = "CALL_ERROR";
}
