use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use serde_json::Value;

use super::peer::PeerState;
use super::types::{Entry, Liveness};

/// Owning collection of every known peer record, keyed by canonical peer
/// name. All mutation of peer state funnels through this type; callers never
/// hold a record across an await point. Records are inserted once and never
/// removed.
pub struct PeerRegistry {
    peers: DashMap<String, PeerState>,
    local_name: String,
}

impl PeerRegistry {
    pub fn new(local: PeerState) -> Self {
        let local_name = local.name().to_string();
        let peers = DashMap::new();
        peers.insert(local_name.clone(), local);
        Self { peers, local_name }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    /// Adds a record for a newly learned peer. Returns false without touching
    /// the collection when the name is the local node or already present.
    pub fn insert(&self, peer: PeerState) -> bool {
        if peer.name() == self.local_name {
            return false;
        }
        match self.peers.entry(peer.name().to_string()) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(slot) => {
                slot.insert(peer);
                true
            }
        }
    }

    pub fn with_peer<R>(&self, name: &str, f: impl FnOnce(&PeerState) -> R) -> Option<R> {
        self.peers.get(name).map(|peer| f(&peer))
    }

    pub fn with_peer_mut<R>(&self, name: &str, f: impl FnOnce(&mut PeerState) -> R) -> Option<R> {
        self.peers.get_mut(name).map(|mut peer| f(&mut peer))
    }

    pub fn with_local<R>(&self, f: impl FnOnce(&PeerState) -> R) -> R {
        self.with_peer(&self.local_name, f)
            .expect("local record exists for the life of the registry")
    }

    pub fn with_local_mut<R>(&self, f: impl FnOnce(&mut PeerState) -> R) -> R {
        self.with_peer_mut(&self.local_name, f)
            .expect("local record exists for the life of the registry")
    }

    pub fn for_each(&self, mut f: impl FnMut(&PeerState)) {
        for peer in self.peers.iter() {
            f(&peer);
        }
    }

    pub fn remote_names(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|peer| !peer.is_local())
            .map(|peer| peer.name().to_string())
            .collect()
    }

    /// Remote peers not declared dead. Freshly discovered (suspect) peers
    /// count as live so that seeds are dialed before their first response.
    pub fn live_remote(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|peer| !peer.is_local() && peer.liveness() != Liveness::Dead)
            .map(|peer| peer.name().to_string())
            .collect()
    }

    pub fn dead_remote(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|peer| !peer.is_local() && peer.liveness() == Liveness::Dead)
            .map(|peer| peer.name().to_string())
            .collect()
    }

    /// Runs the TTL sweep over every record, the local one included.
    /// Returns `(peer, key, entry)` for each removed entry.
    pub fn expire_all(&self, now: u64) -> Vec<(String, String, Entry)> {
        let mut removed = Vec::new();
        for mut peer in self.peers.iter_mut() {
            let name = peer.name().to_string();
            for (key, entry) in peer.expire_keys(now) {
                removed.push((name.clone(), key, entry));
            }
        }
        removed
    }

    /// Re-evaluates every remote record's suspicion timer.
    /// Returns the transitions that occurred.
    pub fn evaluate_liveness(
        &self,
        now: u64,
        suspect_after_ms: u64,
        dead_after_ms: u64,
    ) -> Vec<(String, Liveness)> {
        let mut transitions = Vec::new();
        for mut peer in self.peers.iter_mut() {
            if let Some(state) = peer.evaluate_liveness(now, suspect_after_ms, dead_after_ms) {
                transitions.push((peer.name().to_string(), state));
            }
        }
        transitions
    }

    pub fn value(&self, peer: &str, key: &str) -> Option<Value> {
        self.with_peer(peer, |peer| peer.value(key)).flatten()
    }

    pub fn keys_of(&self, peer: &str) -> Vec<String> {
        self.with_peer(peer, |peer| peer.keys()).unwrap_or_default()
    }
}
