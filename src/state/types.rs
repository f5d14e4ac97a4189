use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved key holding a peer's heartbeat counter.
pub const HEARTBEAT_KEY: &str = "__heartbeat__";

/// Wire prefix marking a key as an ephemeral application event.
pub const EVENT_PREFIX: &str = "say:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Suspect,
    Dead,
}

/// A single versioned value in a peer's state space.
///
/// `version` is a strictly increasing counter scoped to the owning peer.
/// `expires_at` is an absolute wall-clock millisecond timestamp; once set for
/// a version it is never changed (a rewrite produces a new version).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub value: serde_json::Value,
    pub version: u64,
    pub expires_at: Option<u64>,
}

/// Discriminated key type, decoded once at the wire boundary.
///
/// Ordinary keys are plain state; event keys carry an ephemeral application
/// event name plus the publisher-assigned unique id suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateKey {
    Ordinary(String),
    Event { name: String, id: String },
}

impl StateKey {
    pub fn decode(raw: &str) -> Self {
        match raw.strip_prefix(EVENT_PREFIX) {
            Some(rest) => {
                let (name, id) = rest.split_once(':').unwrap_or((rest, ""));
                StateKey::Event {
                    name: name.to_string(),
                    id: id.to_string(),
                }
            }
            None => StateKey::Ordinary(raw.to_string()),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            StateKey::Ordinary(key) => key.clone(),
            StateKey::Event { name, id } => format!("{}{}:{}", EVENT_PREFIX, name, id),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, StateKey::Ordinary(key) if key == HEARTBEAT_KEY)
    }
}

/// Canonical peer name: `address:port`, with IPv6 addresses bracketed.
pub fn peer_name(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    }
}

/// Parses a canonical peer name back into `(address, port)`.
pub fn parse_peer_name(name: &str) -> Result<(String, u16)> {
    static BRACKETED: OnceLock<Regex> = OnceLock::new();
    let bracketed = BRACKETED
        .get_or_init(|| Regex::new(r"^\[(.+)\]:([0-9]+)$").expect("static pattern compiles"));

    if let Some(captures) = bracketed.captures(name) {
        let address = captures[1].to_string();
        let port: u16 = captures[2]
            .parse()
            .map_err(|_| anyhow!("invalid port in peer name: {}", name))?;
        return Ok((address, port));
    }

    let (address, port) = name
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("peer name missing port: {}", name))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("invalid port in peer name: {}", name))?;
    Ok((address.to_string(), port))
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
