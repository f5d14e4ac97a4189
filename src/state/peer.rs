use serde_json::Value;
use std::collections::BTreeMap;

use super::types::{Entry, HEARTBEAT_KEY, Liveness, now_ms, peer_name};

/// Result of applying a remotely originated delta.
pub struct ApplyOutcome {
    /// The delta carried a newer version and was stored.
    pub accepted: bool,
    /// The accepted delta brought the peer back from Suspect/Dead.
    pub revived: bool,
}

/// Versioned state of one known peer, including the local node itself.
///
/// Only the owning peer produces new versions for its record: the local
/// record is written through `update_local`/`beat_heart`, every remote record
/// only through `apply_remote`. Records are created when a peer is first
/// learned of and are never removed; a dead peer keeps its cached state.
#[derive(Debug, Clone)]
pub struct PeerState {
    address: String,
    port: u16,
    name: String,
    entries: BTreeMap<String, Entry>,
    max_version: u64,
    liveness: Liveness,
    last_observed_ms: u64,
    is_local: bool,
}

impl PeerState {
    /// The local node's own record. Always alive.
    pub fn local(address: &str, port: u16) -> Self {
        Self::build(address, port, Liveness::Alive, true)
    }

    /// A freshly discovered remote peer. Starts out suspect until the first
    /// accepted update confirms it, which also emits the peer-alive signal.
    pub fn remote(address: &str, port: u16) -> Self {
        Self::build(address, port, Liveness::Suspect, false)
    }

    fn build(address: &str, port: u16, liveness: Liveness, is_local: bool) -> Self {
        Self {
            address: address.to_string(),
            port,
            name: peer_name(address, port),
            entries: BTreeMap::new(),
            max_version: 0,
            liveness,
            last_observed_ms: now_ms(),
            is_local,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn max_version(&self) -> u64 {
        self.max_version
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Writes a key on the local record, assigning the next version.
    /// Valid only for the local node's own record.
    pub fn update_local(&mut self, key: &str, value: Value, expires_at: Option<u64>) -> u64 {
        debug_assert!(self.is_local, "update_local on a remote record");
        self.max_version += 1;
        let version = self.max_version;
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at,
            },
        );
        self.last_observed_ms = now_ms();
        version
    }

    /// Applies a delta received over the network. A version at or below the
    /// currently stored version for the key is a no-op; an accepted update
    /// advances `max_version` and resets the suspicion timer.
    pub fn apply_remote(
        &mut self,
        key: &str,
        value: Value,
        version: u64,
        expires_at: Option<u64>,
    ) -> ApplyOutcome {
        if let Some(existing) = self.entries.get(key)
            && version <= existing.version
        {
            return ApplyOutcome {
                accepted: false,
                revived: false,
            };
        }

        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                expires_at,
            },
        );
        self.max_version = self.max_version.max(version);
        self.last_observed_ms = now_ms();

        let revived = self.liveness != Liveness::Alive;
        self.liveness = Liveness::Alive;

        ApplyOutcome {
            accepted: true,
            revived,
        }
    }

    /// Increments the reserved heartbeat counter, producing a new version.
    /// Local record only; remote heartbeats arrive as ordinary deltas.
    pub fn beat_heart(&mut self) -> u64 {
        let beats = self
            .entries
            .get(HEARTBEAT_KEY)
            .and_then(|entry| entry.value.as_u64())
            .unwrap_or(0);
        self.update_local(HEARTBEAT_KEY, Value::from(beats + 1), None)
    }

    /// Removes entries whose expiry has passed and returns them for event
    /// emission. Expiry is local; peers that copied the value keep it until
    /// their own sweep.
    pub fn expire_keys(&mut self, now: u64) -> Vec<(String, Entry)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry.expires_at, Some(at) if at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|entry| (key, entry)))
            .collect()
    }

    /// Entries newer than `version`, ascending by version so a receiver can
    /// apply them without tripping the monotonicity check.
    pub fn deltas_after(&self, version: u64) -> Vec<(String, Entry)> {
        let mut deltas: Vec<(String, Entry)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.version > version)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        deltas.sort_by_key(|(_, entry)| entry.version);
        deltas
    }

    /// Advances the failure-detector state machine for a remote record.
    /// Returns the new state on a transition. Alive turns suspect after
    /// `suspect_after_ms` of silence, suspect turns dead after
    /// `dead_after_ms`; both thresholds count from the last accepted update.
    pub fn evaluate_liveness(
        &mut self,
        now: u64,
        suspect_after_ms: u64,
        dead_after_ms: u64,
    ) -> Option<Liveness> {
        if self.is_local {
            return None;
        }

        let elapsed = now.saturating_sub(self.last_observed_ms);
        match self.liveness {
            Liveness::Alive if elapsed > suspect_after_ms => {
                self.liveness = Liveness::Suspect;
                Some(Liveness::Suspect)
            }
            Liveness::Suspect if elapsed > dead_after_ms => {
                self.liveness = Liveness::Dead;
                Some(Liveness::Dead)
            }
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn backdate_last_observed(&mut self, ms: u64) {
        self.last_observed_ms = self.last_observed_ms.saturating_sub(ms);
    }
}
