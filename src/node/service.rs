use anyhow::{Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

use super::crypto::PayloadCipher;
use super::protocol::{self, WireMessage};
use super::transport::{self, MAX_DATAGRAM_BYTES};
use super::types::{GossipConfig, GossipEvent};
use crate::reconcile::{self, Delta, Digest};
use crate::state::peer::PeerState;
use crate::state::registry::PeerRegistry;
use crate::state::types::{Liveness, StateKey, now_ms, parse_peer_name, peer_name};

/// How long one exchange may sit waiting for the next frame before it is
/// abandoned. The failure detector, not a retry, reacts to unreachability.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The gossip orchestrator: owns the peer-record collection, runs the gossip
/// and heartbeat timers, drives the three-message exchange over both
/// transports, and re-emits accepted updates as typed events.
pub struct GossipNode {
    config: GossipConfig,
    peer_name: String,
    peers: PeerRegistry,
    cipher: PayloadCipher,
    events: broadcast::Sender<GossipEvent>,
    gossip_kick: Notify,
    running: AtomicBool,
    event_seq: AtomicU64,
    event_prefix: String,
    udp_socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipNode {
    pub fn new(config: GossipConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let peer_name = peer_name(&config.address, config.port);
        let peers = PeerRegistry::new(PeerState::local(&config.address, config.port));
        let cipher = PayloadCipher::new(config.network_key.as_deref());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        // Compact address token prefixing every published event id; the
        // sequence seeds from the clock so a restarted node cannot reuse an
        // id inside the TTL window.
        let event_prefix = URL_SAFE_NO_PAD.encode(peer_name.as_bytes());

        Ok(Arc::new(Self {
            config,
            peer_name,
            peers,
            cipher,
            events,
            gossip_kick: Notify::new(),
            running: AtomicBool::new(false),
            event_seq: AtomicU64::new(now_ms()),
            event_prefix,
            udp_socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GossipEvent> {
        self.events.subscribe()
    }

    /// Binds both channels, registers the seed peers, and starts the gossip
    /// and heartbeat timers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("node already started");
        }
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(error) => {
                // Roll back whatever half of the startup got done.
                for task in self.tasks.lock().expect("task registry lock").drain(..) {
                    task.abort();
                }
                *self.udp_socket.lock().expect("udp socket lock") = None;
                self.running.store(false, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    async fn start_inner(self: &Arc<Self>) -> Result<()> {
        for seed in &self.config.seeds {
            let (address, port) = parse_peer_name(seed)?;
            let resolved = self.resolve_address(&address);
            if peer_name(&resolved, port) == self.peer_name {
                bail!("cannot specify self as seed");
            }
        }

        let bind_ip: IpAddr = self
            .config
            .address
            .parse()
            .map_err(|_| anyhow!("invalid listen address: {}", self.config.address))?;
        let listen_ip = if self.config.public {
            match bind_ip {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            }
        } else {
            bind_ip
        };
        let listen_addr = SocketAddr::new(listen_ip, self.config.port);

        let listener = TcpListener::bind(listen_addr).await?;
        tracing::info!("{} TCP listening on {}", self.peer_name, listen_addr);

        if self.config.udp {
            let socket = Arc::new(UdpSocket::bind(listen_addr).await?);
            *self.udp_socket.lock().expect("udp socket lock") = Some(socket.clone());
            tracing::info!("{} UDP listening on {}", self.peer_name, listen_addr);

            let node = self.clone();
            self.track(tokio::spawn(async move { node.udp_loop(socket).await }));
        }

        let node = self.clone();
        self.track(tokio::spawn(async move { node.tcp_loop(listener).await }));

        self.handle_new_peers(&self.config.seeds);

        let node = self.clone();
        self.track(tokio::spawn(async move { node.heartbeat_loop().await }));

        let node = self.clone();
        self.track(tokio::spawn(async move { node.gossip_loop().await }));

        self.emit(GossipEvent::Start);
        Ok(())
    }

    /// Cancels both timers and closes both listening channels. In-flight
    /// exchanges are not guaranteed to complete.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().expect("task registry lock").drain(..) {
            task.abort();
        }
        *self.udp_socket.lock().expect("udp socket lock") = None;
        self.emit(GossipEvent::Stop);
        tracing::info!("{} stopped", self.peer_name);
    }

    // --- Local state API ---

    pub fn set(&self, key: &str, value: Value) {
        self.set_entry(key, value, None);
    }

    pub fn set_expiring(&self, key: &str, value: Value, ttl: Duration) {
        self.set_entry(key, value, Some(now_ms() + ttl.as_millis() as u64));
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.peers.with_local(|local| local.value(key))
    }

    pub fn remote_value(&self, peer: &str, key: &str) -> Option<Value> {
        self.peers.value(peer, key)
    }

    pub fn remote_keys(&self, peer: &str) -> Vec<String> {
        self.peers.keys_of(peer)
    }

    pub fn known_peers(&self) -> Vec<String> {
        self.peers.remote_names()
    }

    pub fn live_peers(&self) -> Vec<String> {
        self.peers.live_remote()
    }

    pub fn dead_peers(&self) -> Vec<String> {
        self.peers.dead_remote()
    }

    /// Registers a peer by name. Returns false for self or an already known
    /// peer, without touching the collection.
    pub fn add_peer(&self, name: &str) -> bool {
        self.handle_new_peers(&[name.to_string()]) == 1
    }

    fn set_entry(&self, key: &str, value: Value, expires_at: Option<u64>) {
        self.peers.with_local_mut(|local| {
            local.update_local(key, value, expires_at);
        });
    }

    // --- Ephemeral event API ---

    /// Publishes an ephemeral event with the default TTL and gossips
    /// immediately.
    pub fn say(&self, event: &str, value: Value) {
        self.say_with(event, value, self.config.default_event_ttl(), false);
    }

    /// Publishes an ephemeral event. `buffered` batches it with the next
    /// scheduled round instead of gossiping immediately.
    pub fn say_with(&self, event: &str, value: Value, ttl: Duration, buffered: bool) {
        let id = format!(
            "{}_{}",
            self.event_prefix,
            self.event_seq.fetch_add(1, Ordering::Relaxed)
        );
        let key = StateKey::Event {
            name: event.to_string(),
            id,
        }
        .encode();
        self.set_entry(&key, value, Some(now_ms() + ttl.as_millis() as u64));

        if !buffered {
            self.gossip_now();
        }
    }

    /// Forces an immediate gossip round and resets the gossip timer.
    pub fn gossip_now(&self) {
        self.gossip_kick.notify_one();
    }

    /// Invokes the callback with `(value, peer)` every time the named event
    /// is heard from the network.
    pub fn hear<F>(&self, event: &str, mut callback: F)
    where
        F: FnMut(Value, String) + Send + 'static,
    {
        let mut events = self.subscribe();
        let wanted = event.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(GossipEvent::Say { event, value, peer }) if event == wanted => {
                        callback(value, peer);
                    }
                    Ok(GossipEvent::Stop) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        });
    }

    /// Like `hear`, but the callback fires at most once.
    pub fn hear_once<F>(&self, event: &str, callback: F)
    where
        F: FnOnce(Value, String) + Send + 'static,
    {
        let mut events = self.subscribe();
        let wanted = event.to_string();
        tokio::spawn(async move {
            let mut callback = Some(callback);
            loop {
                match events.recv().await {
                    Ok(GossipEvent::Say { event, value, peer }) if event == wanted => {
                        if let Some(callback) = callback.take() {
                            callback(value, peer);
                        }
                        break;
                    }
                    Ok(GossipEvent::Stop) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        });
    }

    /// Invokes the callback with `(peer, value, expires_at)` whenever any
    /// peer's accepted update touches the named key.
    pub fn know<F>(&self, key: &str, mut callback: F)
    where
        F: FnMut(String, Value, Option<u64>) + Send + 'static,
    {
        let mut events = self.subscribe();
        let wanted = key.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(GossipEvent::Set {
                        peer,
                        key,
                        value,
                        expires_at,
                    }) if key == wanted => {
                        callback(peer, value, expires_at);
                    }
                    Ok(GossipEvent::Stop) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        });
    }

    /// Opportunistic single-key convergence: whenever a peer reports a value
    /// for the key that differs from the local copy, adopt and re-publish it.
    pub fn believe(self: &Arc<Self>, key: &str) {
        let mut events = self.subscribe();
        let wanted = key.to_string();
        let node = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(GossipEvent::Set {
                        peer,
                        key,
                        value,
                        expires_at,
                    }) if key == wanted => {
                        let Some(node) = node.upgrade() else { break };
                        if peer != node.peer_name && node.get(&key).as_ref() != Some(&value) {
                            node.set_entry(&key, value, expires_at);
                        }
                    }
                    Ok(GossipEvent::Stop) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        });
    }

    // --- Gossip rounds ---

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.gossip_kick.notified() => {
                    interval.reset();
                }
            }
            self.gossip_round();
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            interval.tick().await;
            self.peers.with_local_mut(|local| {
                local.beat_heart();
            });
        }
    }

    fn gossip_round(self: &Arc<Self>) {
        let now = now_ms();

        for (peer, key, entry) in self.peers.expire_all(now) {
            self.emit(GossipEvent::Expire {
                peer,
                key,
                value: entry.value,
                expires_at: entry.expires_at.unwrap_or(now),
            });
        }

        let live = self.peers.live_remote();
        let dead = self.peers.dead_remote();

        if !live.is_empty() {
            let target = live[rand::thread_rng().gen_range(0..live.len())].clone();
            self.spawn_exchange(target);
        }

        // Probe a dead peer with probability shrinking as more live peers
        // are known, so probing never starves the live gossip budget.
        if !dead.is_empty() {
            let probability = dead_probe_probability(live.len(), dead.len());
            if rand::random::<f64>() < probability {
                let target = dead[rand::thread_rng().gen_range(0..dead.len())].clone();
                self.spawn_exchange(target);
            }
        }

        // Bias toward seed-originated topology while the network is sparse.
        let seed_count = self.config.seeds.len();
        if seed_count > 0 && live.len() < seed_count {
            let all = self.peers.remote_names();
            if !all.is_empty() && rand::random::<f64>() < seed_count as f64 / all.len() as f64 {
                let target = all[rand::thread_rng().gen_range(0..all.len())].clone();
                self.spawn_exchange(target);
            }
        }

        let suspect_after = self.config.suspect_after().as_millis() as u64;
        let dead_after = self.config.dead_after().as_millis() as u64;
        for (peer, state) in self.peers.evaluate_liveness(now, suspect_after, dead_after) {
            match state {
                Liveness::Suspect => {
                    tracing::debug!("{} suspects {}", self.peer_name, peer);
                }
                Liveness::Dead => {
                    tracing::info!("{} declares {} dead", self.peer_name, peer);
                    self.emit(GossipEvent::PeerFailed { peer });
                }
                Liveness::Alive => {}
            }
        }
    }

    fn spawn_exchange(self: &Arc<Self>, target: String) {
        let Some((address, port)) = self
            .peers
            .with_peer(&target, |peer| (peer.address().to_string(), peer.port()))
        else {
            return;
        };

        let resolved = self.resolve_address(&address);
        if port == self.config.port
            && (address == self.config.address || resolved == self.config.address)
        {
            return;
        }

        let node = self.clone();
        tokio::spawn(async move {
            let message = WireMessage::request(reconcile::digest(&node.peers));
            if let Err(error) = node.send_message(message, &resolved, port).await {
                tracing::debug!("{} gossip to {} failed: {}", node.peer_name, target, error);
            }
        });
    }

    // --- Transport ---

    /// Sends one message, preferring a single datagram and falling back to a
    /// one-shot connection for this message when the payload is too large or
    /// the datagram channel is off. A non-terminal message keeps driving the
    /// rest of the exchange on the fallback socket.
    async fn send_message(&self, message: WireMessage, address: &str, port: u16) -> Result<()> {
        let addr = self.target_addr(address, port).await?;
        let payload = self.encode(&message)?;
        let terminal = message.t == protocol::SECOND_RESPONSE;

        let socket = self.udp_socket.lock().expect("udp socket lock").clone();
        if let Some(socket) = socket
            && payload.len() < MAX_DATAGRAM_BYTES
        {
            socket.send_to(&payload, addr).await?;
            tracing::debug!(
                "{} => {} type {} ({} bytes, udp)",
                self.peer_name,
                addr,
                message.t,
                payload.len()
            );
            return Ok(());
        }

        let mut stream = TcpStream::connect(addr).await?;
        transport::write_frame(&mut stream, &payload).await?;
        tracing::debug!(
            "{} => {} type {} ({} bytes, tcp)",
            self.peer_name,
            addr,
            message.t,
            payload.len()
        );
        if !terminal {
            self.drive_exchange(&mut stream).await?;
        }
        Ok(())
    }

    /// Reads frames off a connection and answers them until the exchange
    /// completes, the peer hangs up, a message fails to decode, or the
    /// exchange times out.
    async fn drive_exchange(&self, stream: &mut TcpStream) -> Result<()> {
        loop {
            let frame = tokio::time::timeout(EXCHANGE_TIMEOUT, transport::read_frame(stream))
                .await
                .map_err(|_| anyhow!("exchange timed out"))??;
            let Some(payload) = frame else {
                return Ok(());
            };
            let Some(message) = self.decode(&payload) else {
                return Ok(());
            };
            let Some(reply) = self.handle_message(message) else {
                return Ok(());
            };

            let terminal = reply.t == protocol::SECOND_RESPONSE;
            let bytes = self.encode(&reply)?;
            transport::write_frame(stream, &bytes).await?;
            if terminal {
                return Ok(());
            }
        }
    }

    async fn tcp_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((mut stream, remote)) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = node.drive_exchange(&mut stream).await {
                            tracing::debug!(
                                "{} exchange with {} abandoned: {}",
                                node.peer_name,
                                remote,
                                error
                            );
                        }
                    });
                }
                Err(error) => {
                    tracing::error!("{} accept failed: {}", self.peer_name, error);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn udp_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    let payload = buf[..len].to_vec();
                    let node = self.clone();
                    tokio::spawn(async move { node.handle_datagram(payload, source).await });
                }
                Err(error) => {
                    tracing::error!("{} UDP receive failed: {}", self.peer_name, error);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, payload: Vec<u8>, source: SocketAddr) {
        let Some(message) = self.decode(&payload) else {
            return;
        };
        let Some(reply) = self.handle_message(message) else {
            return;
        };
        // A datagram's source port is the peer's bound port, which is also
        // its listening port on both channels.
        let address = source.ip().to_string();
        if let Err(error) = self.send_message(reply, &address, source.port()).await {
            tracing::debug!("{} reply to {} failed: {}", self.peer_name, source, error);
        }
    }

    // --- Protocol state machine ---

    fn handle_message(&self, message: WireMessage) -> Option<WireMessage> {
        match message.t {
            protocol::REQUEST => Some(self.first_response(message.d.unwrap_or_default())),
            protocol::FIRST_RESPONSE => {
                if let Some(deltas) = &message.u {
                    self.apply_updates(deltas);
                }
                Some(self.second_response(message.r.unwrap_or_default()))
            }
            protocol::SECOND_RESPONSE => {
                if let Some(deltas) = &message.u {
                    self.apply_updates(deltas);
                }
                None
            }
            other => {
                tracing::debug!("{} ignoring unknown message type {}", self.peer_name, other);
                None
            }
        }
    }

    fn first_response(&self, digest: Digest) -> WireMessage {
        let result = reconcile::scuttle(&self.peers, &digest);
        self.handle_new_peers(&result.new_peers);
        WireMessage::first_response(result.requests, result.deltas)
    }

    fn second_response(&self, requests: Digest) -> WireMessage {
        WireMessage::second_response(reconcile::fetch_deltas(&self.peers, &requests))
    }

    fn apply_updates(&self, deltas: &[Delta]) {
        for update in reconcile::apply_deltas(&self.peers, deltas) {
            if update.revived {
                tracing::info!("{} peer {} is alive", self.peer_name, update.peer);
                self.emit(GossipEvent::PeerAlive {
                    peer: update.peer.clone(),
                });
            }

            if !update.key.is_heartbeat() || self.config.emit_heartbeat_updates {
                self.emit(GossipEvent::Set {
                    peer: update.peer.clone(),
                    key: update.raw_key.clone(),
                    value: update.value.clone(),
                    expires_at: update.expires_at,
                });
            }

            if let StateKey::Event { name, .. } = update.key {
                self.emit(GossipEvent::Say {
                    event: name,
                    value: update.value,
                    peer: update.peer,
                });
            }
        }
    }

    // --- Discovery ---

    fn handle_new_peers(&self, names: &[String]) -> usize {
        let mut added = 0;
        for raw in names {
            let (address, port) = match parse_peer_name(raw) {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::warn!(
                        "{} ignoring malformed peer name {}: {}",
                        self.peer_name,
                        raw,
                        error
                    );
                    continue;
                }
            };

            let resolved = self.resolve_address(&address);
            let name = peer_name(&resolved, port);
            if name == self.peer_name {
                continue;
            }

            if self.peers.insert(PeerState::remote(&resolved, port)) {
                tracing::info!("{} discovered peer {}", self.peer_name, name);
                self.emit(GossipEvent::PeerNew { peer: name });
                added += 1;
            }
        }
        added
    }

    fn resolve_address(&self, address: &str) -> String {
        self.config
            .address_map
            .get(address)
            .cloned()
            .unwrap_or_else(|| address.to_string())
    }

    async fn target_addr(&self, address: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        tokio::net::lookup_host((address, port))
            .await?
            .next()
            .ok_or_else(|| anyhow!("no address found for {}", address))
    }

    // --- Encoding ---

    fn encode(&self, message: &WireMessage) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(message)?;
        self.cipher.seal(&json)
    }

    fn decode(&self, payload: &[u8]) -> Option<WireMessage> {
        let plain = match self.cipher.open(payload) {
            Ok(plain) => plain,
            Err(error) => {
                tracing::debug!(
                    "{} dropping undecipherable message: {}",
                    self.peer_name,
                    error
                );
                return None;
            }
        };
        match serde_json::from_slice(&plain) {
            Ok(message) => Some(message),
            Err(error) => {
                tracing::debug!("{} dropping malformed message: {}", self.peer_name, error);
                None
            }
        }
    }

    fn emit(&self, event: GossipEvent) {
        let _ = self.events.send(event);
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("task registry lock").push(task);
    }
}

/// Chance of probing one dead peer this round. Zero without dead peers,
/// approaching certainty when the dead outnumber the live.
pub(crate) fn dead_probe_probability(live: usize, dead: usize) -> f64 {
    dead as f64 / (live as f64 + 1.0)
}
