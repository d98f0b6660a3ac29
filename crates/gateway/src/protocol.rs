//! Application framing: one UTF-8 JSON message per frame.
//!
//! Every message carries a `type` discriminator, an optional `message_id`
//! (always present on outbound frames) and a millisecond `timestamp`.
//! Unknown discriminators surface as [`ProtocolError::UnknownType`].

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Stable error-frame codes.
pub mod code {
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// One logical application message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Unique message identifier; optional on inbound frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Milliseconds since epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: Body,
}

/// Type-specific message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// In-band authentication.
    Auth { token: String },

    /// Direct message to a user.
    Message {
        /// Sender user id; stamped by the gateway, client value ignored.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Recipient user id.
        to: String,
        payload: TextPayload,
    },

    /// Message to a group.
    GroupMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        group_id: String,
        payload: TextPayload,
    },

    /// Typing indicator, routed like a direct message but best-effort.
    Typing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
        is_typing: bool,
    },

    /// Online/offline/away status.
    Presence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        /// online, away, offline.
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
    },

    /// Delivery acknowledgement.
    Ack {
        original_message_id: String,
        /// ok, delivered, read, failed.
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    /// Error report.
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// Application-level keepalive.
    Heartbeat { sequence: i64 },
}

/// Text payload shared by direct and group messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "type")]
    msg_type: Option<String>,
}

const KNOWN_TYPES: &[&str] = &[
    "auth",
    "message",
    "group_message",
    "typing",
    "presence",
    "ack",
    "error",
    "heartbeat",
];

impl Frame {
    /// Parse an inbound frame, classifying failures.
    pub fn parse(raw: &str) -> Result<Frame, ProtocolError> {
        match serde_json::from_str::<Frame>(raw) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                // Distinguish an unknown discriminator from a bad shape.
                match serde_json::from_str::<TypeProbe>(raw) {
                    Ok(TypeProbe {
                        msg_type: Some(ref t),
                    }) if !KNOWN_TYPES.contains(&t.as_str()) => {
                        Err(ProtocolError::UnknownType(t.clone()))
                    }
                    _ => Err(ProtocolError::Malformed(err.to_string())),
                }
            }
        }
    }

    /// Build an outbound frame with a fresh id and timestamp.
    pub fn outbound(body: Body) -> Frame {
        Frame {
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }

    /// Build an outbound error frame.
    pub fn error(code: &str, message: &str, details: Option<String>) -> Frame {
        Frame::outbound(Body::Error {
            code: code.to_string(),
            message: message.to_string(),
            details,
        })
    }

    /// Build an acknowledgement frame.
    pub fn ack(original_message_id: &str, status: &str) -> Frame {
        Frame::outbound(Body::Ack {
            original_message_id: original_message_id.to_string(),
            status: status.to_string(),
            to: None,
        })
    }

    /// Build a presence frame.
    pub fn presence(user_id: &str, status: &str, device: Option<String>) -> Frame {
        Frame::outbound(Body::Presence {
            user_id: Some(user_id.to_string()),
            status: status.to_string(),
            last_seen: Some(chrono::Utc::now().timestamp_millis()),
            device,
        })
    }

    /// Serialize for the wire, stamping id and timestamp if absent.
    pub fn encode(&mut self) -> Result<String, serde_json::Error> {
        if self.message_id.is_none() {
            self.message_id = Some(Uuid::new_v4().to_string());
        }
        if self.timestamp == 0 {
            self.timestamp = chrono::Utc::now().timestamp_millis();
        }
        serde_json::to_string(self)
    }
}
