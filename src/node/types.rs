use anyhow::{Result, bail};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_millis(2500);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);

/// Bootstrap configuration for a gossip node.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Address this node advertises and binds to.
    pub address: String,
    /// Listening port, shared by the TCP and UDP channels. Required, non-zero.
    pub port: u16,
    /// Initial seed peers, `address:port` (IPv6 as `[addr]:port`).
    pub seeds: Vec<String>,
    /// Manual translation for environments where an advertised address
    /// differs from a routable one: mapped-from -> mapped-to.
    pub address_map: HashMap<String, String>,
    /// Shared network key; when set, every payload is encrypted on the wire.
    pub network_key: Option<String>,
    /// true = accept connections from any interface, false = bind only the
    /// configured address.
    pub public: bool,
    pub gossip_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Whether to run the datagram channel (recommended).
    pub udp: bool,
    /// Re-emit heartbeat changes as ordinary `Set` events. Off by default;
    /// heartbeats are internal noise.
    pub emit_heartbeat_updates: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 0,
            seeds: vec![],
            address_map: HashMap::new(),
            network_key: None,
            public: true,
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            udp: true,
            emit_heartbeat_updates: false,
        }
    }
}

impl GossipConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("must specify a non-zero port");
        }
        Ok(())
    }

    /// Silence threshold after which an alive peer turns suspect.
    pub fn suspect_after(&self) -> Duration {
        self.gossip_interval * 4
    }

    /// Silence threshold after which a suspect peer is declared dead.
    pub fn dead_after(&self) -> Duration {
        self.gossip_interval * 8
    }

    /// Default lifetime of a published ephemeral event.
    pub fn default_event_ttl(&self) -> Duration {
        self.gossip_interval * 8
    }
}

/// The closed set of notifications a node emits to the embedding
/// application. `Set` and `Say` fire once per accepted remote update;
/// `Expire` fires on every local TTL sweep, the node's own record included.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    Start,
    Stop,
    /// A record was created for a newly learned peer.
    PeerNew { peer: String },
    /// An accepted update brought a peer to Alive from Suspect/Dead.
    PeerAlive { peer: String },
    /// The failure detector declared a peer dead.
    PeerFailed { peer: String },
    /// A TTL sweep removed an entry from the named peer's record.
    Expire {
        peer: String,
        key: String,
        value: Value,
        expires_at: u64,
    },
    /// An accepted remote update, keyed by the raw wire key.
    Set {
        peer: String,
        key: String,
        value: Value,
        expires_at: Option<u64>,
    },
    /// An ephemeral application event, id suffix already stripped.
    Say {
        event: String,
        value: Value,
        peer: String,
    },
}
