use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::state::registry::PeerRegistry;
use crate::state::types::StateKey;

/// Compact summary of local knowledge: peer name -> highest version seen.
pub type Digest = HashMap<String, u64>;

/// One state update in transit: which peer's record it belongs to, the key,
/// the value, the owner-assigned version, and the optional absolute expiry.
/// Field names are single letters to keep the wire form compact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    #[serde(rename = "p")]
    pub peer: String,
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "v")]
    pub value: Value,
    #[serde(rename = "n")]
    pub version: u64,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Outcome of comparing a remote digest against local knowledge.
pub struct Scuttle {
    /// Peers the remote knows about and we do not.
    pub new_peers: Vec<String>,
    /// Peers where the remote is ahead: name -> version we already hold.
    pub requests: HashMap<String, u64>,
    /// Updates the remote is missing, version-ascending per peer.
    pub deltas: Vec<Delta>,
}

/// One update accepted into the registry, decoded for event emission.
pub struct Applied {
    pub peer: String,
    pub key: StateKey,
    pub raw_key: String,
    pub value: Value,
    pub expires_at: Option<u64>,
    /// The update brought the peer back from Suspect/Dead.
    pub revived: bool,
}

/// Builds the digest of everything known locally, the local record included.
/// O(known peers), independent of entry counts.
pub fn digest(registry: &PeerRegistry) -> Digest {
    let mut digest = Digest::new();
    registry.for_each(|peer| {
        digest.insert(peer.name().to_string(), peer.max_version());
    });
    digest
}

/// Three-way comparison of a remote digest against local knowledge.
///
/// A digest entry for a peer we have never heard of yields both a discovery
/// candidate and a watermark-zero request, so the full history is pulled in
/// the same exchange once the record exists. Comparison is keyed by peer
/// name; the order of digest entries is irrelevant.
pub fn scuttle(registry: &PeerRegistry, remote_digest: &Digest) -> Scuttle {
    let mut new_peers = Vec::new();
    let mut requests = HashMap::new();
    let mut deltas = Vec::new();

    let mut names: Vec<&String> = remote_digest.keys().collect();
    names.sort();

    for name in names {
        let remote_version = remote_digest[name];
        let local_version = registry.with_peer(name, |peer| peer.max_version());

        match local_version {
            None => {
                new_peers.push(name.clone());
                requests.insert(name.clone(), 0);
            }
            Some(local_version) if local_version > remote_version => {
                deltas.extend(deltas_for(registry, name, remote_version));
            }
            Some(local_version) if local_version < remote_version => {
                requests.insert(name.clone(), local_version);
            }
            Some(_) => {}
        }
    }

    Scuttle {
        new_peers,
        requests,
        deltas,
    }
}

/// Answers a request map with the entries above each requested watermark,
/// flattened into one sequence, version-ascending within each peer.
pub fn fetch_deltas(registry: &PeerRegistry, requests: &HashMap<String, u64>) -> Vec<Delta> {
    let mut names: Vec<&String> = requests.keys().collect();
    names.sort();

    let mut deltas = Vec::new();
    for name in names {
        deltas.extend(deltas_for(registry, name, requests[name]));
    }
    deltas
}

/// Applies incoming deltas through each target record's version check.
/// Deltas for peers with no record yet are dropped; discovery must have run
/// first. Returns the accepted updates with their keys decoded.
pub fn apply_deltas(registry: &PeerRegistry, deltas: &[Delta]) -> Vec<Applied> {
    let mut applied = Vec::new();

    for delta in deltas {
        let outcome = registry.with_peer_mut(&delta.peer, |peer| {
            peer.apply_remote(&delta.key, delta.value.clone(), delta.version, delta.expires_at)
        });

        match outcome {
            None => {
                tracing::debug!("dropping delta for unknown peer {}", delta.peer);
            }
            Some(outcome) if outcome.accepted => {
                applied.push(Applied {
                    peer: delta.peer.clone(),
                    key: StateKey::decode(&delta.key),
                    raw_key: delta.key.clone(),
                    value: delta.value.clone(),
                    expires_at: delta.expires_at,
                    revived: outcome.revived,
                });
            }
            Some(_) => {}
        }
    }

    applied
}

fn deltas_for(registry: &PeerRegistry, name: &str, after: u64) -> Vec<Delta> {
    registry
        .with_peer(name, |peer| {
            peer.deltas_after(after)
                .into_iter()
                .map(|(key, entry)| Delta {
                    peer: name.to_string(),
                    key,
                    value: entry.value,
                    version: entry.version,
                    expires_at: entry.expires_at,
                })
                .collect()
        })
        .unwrap_or_default()
}
