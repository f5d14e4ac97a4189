//! Anti-Entropy Reconciliation Module
//!
//! Stateless algorithms that bring two nodes' views of the shared state
//! space into alignment without full-state transfer, following the Cassandra
//! digest-exchange design: a compact digest opens the exchange, and each
//! side then transfers only the versions the other is missing.
//!
//! ## Exchange Shape
//! 1. Initiator sends its digest (peer name -> highest version seen).
//! 2. Responder answers with the deltas the initiator is missing plus a
//!    request map for the versions the responder itself lacks.
//! 3. Initiator answers the request map with the remaining deltas.

pub mod scuttle;

pub use scuttle::{Applied, Delta, Digest, Scuttle, apply_deltas, digest, fetch_deltas, scuttle};
