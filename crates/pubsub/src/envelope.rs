//! Node-tagged wrapper for cross-node publications.
//!
//! Every message placed on the bus is wrapped in an [`Envelope`] carrying
//! the origin node id. A node that receives its own envelope back discards
//! it — the node id is the sole loop-suppression mechanism.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Wrapper for every cross-node publication.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Identifier of the node that published this envelope.
    pub node_id: String,
    /// Publish timestamp, milliseconds since epoch.
    pub timestamp: i64,
    /// Inner application payload, carried verbatim.
    pub message: Box<RawValue>,
}

impl Envelope {
    /// Wrap an application payload for publication from `node_id`.
    pub fn wrap(node_id: &str, payload: &str) -> Result<Self> {
        Ok(Self {
            node_id: node_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            message: RawValue::from_string(payload.to_string())?,
        })
    }

    /// Encode the envelope for the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope received from the wire.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Whether this envelope originated from the given node.
    pub fn is_from(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }
}
