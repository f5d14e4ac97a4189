//! Epidemic Key-Value Gossip Library
//!
//! This library crate implements a peer-to-peer gossip protocol for
//! disseminating and reconciling a shared key-value state space across an
//! unreliable, dynamically changing set of nodes, in the Scuttlebutt /
//! Cassandra anti-entropy style. Each node keeps its own versioned state and
//! an eventually consistent cached view of every other known node's state;
//! nodes periodically exchange compact digests and pull only the deltas they
//! are missing, with no central coordinator.
//!
//! ## Architecture Modules
//! The system is composed of three tightly layered subsystems:
//!
//! - **`state`**: The per-peer versioned store. Tracks entries with
//!   owner-assigned monotonic versions and optional expiry, plus the
//!   Alive/Suspect/Dead failure-detector lifecycle of every known peer.
//! - **`reconcile`**: The anti-entropy algorithms. Digest construction,
//!   three-way delta negotiation, and delta application over the peer
//!   registry.
//! - **`node`**: The orchestrator. Runs the gossip and heartbeat timers,
//!   selects targets, frames and optionally encrypts wire messages over TCP
//!   and UDP, and exposes the publish/subscribe event surface.

pub mod node;
pub mod reconcile;
pub mod state;
