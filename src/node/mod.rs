//! Gossip Orchestrator Module
//!
//! Owns the peer-record collection and everything network-facing: the
//! periodic gossip and heartbeat timers, peer selection, the three-message
//! exchange over framed TCP and best-effort UDP, optional payload
//! encryption, and the typed event surface the embedding application
//! consumes.
//!
//! ## Core Mechanisms
//! - **Peer selection**: one random live target per round, a dead target
//!   with probability `dead / (live + 1)`, and an extra seed-biased pick
//!   while the network is sparse.
//! - **Transport**: every message prefers a single datagram under a
//!   575-byte ceiling and falls back per-message to a length-prefixed
//!   TCP frame; a TCP-carried exchange continues on its own socket.
//! - **Events**: accepted remote updates re-emit as `Set`/`Say`; the
//!   failure detector emits `PeerAlive`/`PeerFailed`.

pub mod crypto;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;
