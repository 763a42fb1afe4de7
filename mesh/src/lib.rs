//! Gossip-Replicated Key/Value Store
//!
//! This crate provides an eventually consistent key/value store replicated
//! over a gossip membership layer:
//! - Pluggable merge semantics per value type, with versioned CAS updates
//! - Broadcast queues that prioritize local writes over relayed ones
//! - Push/pull anti-entropy of the full store
//! - A TCP transport with MD5-checked packets and optional TLS
//! - Zone-aware peer selection through bridge nodes

pub mod broadcast;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod history;
pub mod join;
pub mod kv;
pub mod membership;
pub mod mergeable;
pub mod metrics;
pub mod service;
pub mod transport;
pub mod wire;
pub mod zone;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use client::Client;
pub use codec::{BincodeCodec, Codec, CodecRegistry};
pub use config::{KvConfig, TcpTransportConfig, TlsConfig, ZoneAwareRoutingConfig};
pub use error::{KvError, KvResult, MergeError};
pub use kv::{CasFnError, EntryInfo, Kv, KvDelegate};
pub use membership::{Member, NodeState};
pub use mergeable::{Merge, Mergeable};
pub use crate::metrics::{KvMetrics, TransportMetrics};
pub use service::{KvInitService, KvService};
pub use zone::{NodeRole, ZoneAwareNodeSelection};
