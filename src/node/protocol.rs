//! Gossip Wire Protocol
//!
//! Exactly three message kinds form one exchange, a fixed 1.5-round-trip
//! handshake:
//!
//! 1. `REQUEST { d }` — initiator's digest.
//! 2. `FIRST_RESPONSE { r?, u? }` — responder's request map and the deltas
//!    the initiator is missing.
//! 3. `SECOND_RESPONSE { u? }` — the deltas answering the request map;
//!    terminal.
//!
//! Serialized as compact JSON; optional fields are omitted when empty. An
//! unrecognized type is ignored without a reply.

use serde::{Deserialize, Serialize};

use crate::reconcile::{Delta, Digest};

pub const REQUEST: u8 = 0;
pub const FIRST_RESPONSE: u8 = 1;
pub const SECOND_RESPONSE: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message type: 0 = REQUEST, 1 = FIRST_RESPONSE, 2 = SECOND_RESPONSE.
    pub t: u8,
    /// Digest: peer name -> highest version seen. REQUEST only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Digest>,
    /// Request map: peer name -> version already held. FIRST_RESPONSE only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Digest>,
    /// Delta list, version-ascending per peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<Vec<Delta>>,
}

impl WireMessage {
    pub fn request(digest: Digest) -> Self {
        Self {
            t: REQUEST,
            d: Some(digest),
            r: None,
            u: None,
        }
    }

    pub fn first_response(requests: Digest, deltas: Vec<Delta>) -> Self {
        Self {
            t: FIRST_RESPONSE,
            d: None,
            r: (!requests.is_empty()).then_some(requests),
            u: (!deltas.is_empty()).then_some(deltas),
        }
    }

    pub fn second_response(deltas: Vec<Delta>) -> Self {
        Self {
            t: SECOND_RESPONSE,
            d: None,
            r: None,
            u: (!deltas.is_empty()).then_some(deltas),
        }
    }
}
