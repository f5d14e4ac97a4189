//! Versioned Peer State Module
//!
//! Holds the per-peer versioned key-value store and the failure detector.
//! One `PeerState` exists for every peer the node has ever learned about,
//! the node itself included; the `PeerRegistry` owns the whole collection.
//!
//! ## Core Mechanisms
//! - **Versioning**: every write on a record receives the next strictly
//!   increasing version for that peer; stale deltas are rejected by version.
//! - **Liveness**: an Alive -> Suspect -> Dead state machine driven by the
//!   time since the last accepted update, with revival on any newer delta.
//! - **Expiry**: entries may carry an absolute expiry; a periodic local sweep
//!   removes them without retracting copies other peers already hold.

pub mod peer;
pub mod registry;
pub mod types;
