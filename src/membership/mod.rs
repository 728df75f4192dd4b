//! Peer Membership Cache
//!
//! Canonical node identity and liveness tracking. Every component consults
//! this cache for the mapping between bus node ids, stable node identifiers
//! and human-readable names, and subscribes to status changes through the
//! broadcast channel it exposes.

pub mod peer;

pub use peer::{
    JoinPhase, Liveness, PeerCache, PeerChange, PeerEvent, PeerFilter, PeerNode,
};
