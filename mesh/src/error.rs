//! Error types for the gossip KV store.
//!
//! Errors fall in four groups:
//! - retried inside the store and never surfaced unless retries run out
//!   ([`KvError::VersionMismatch`], [`KvError::NoChangeDetected`]);
//! - terminal for the call but harmless for the store (CAS exhaustion,
//!   unknown codec, invalid metadata, caller function errors);
//! - fatal at construction (invalid config, bind failure, join failure when
//!   configured as fatal);
//! - dropped-and-counted conditions, which are never errors at all and only
//!   show up in metrics and logs.

use std::io;

use thiserror::Error;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    /// Stored version advanced between the CAS read and the CAS merge.
    #[error("version mismatch")]
    VersionMismatch,

    /// The CAS function reported a change but merging it changed nothing.
    #[error("no change detected")]
    NoChangeDetected,

    #[error("too many retries")]
    TooManyRetries,

    #[error("failed to CAS-update key {key}: {source}")]
    CasFailed {
        key: String,
        #[source]
        source: Box<KvError>,
    },

    #[error("CAS function returned error: {0}")]
    CasFunction(#[source] anyhow::Error),

    #[error("codec not found: {0}")]
    CodecNotFound(String),

    #[error("unexpected value type for key {key}, expected {expected}")]
    UnexpectedType { key: String, expected: &'static str },

    #[error("invalid node metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to join cluster: {0}")]
    Join(String),

    #[error("kv store is not running")]
    NotRunning,

    /// A previous start of the shared service failed.
    #[error("kv service failed to start: {0}")]
    StartFailed(String),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl KvError {
    /// Errors the CAS loop handles by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::VersionMismatch | KvError::NoChangeDetected)
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cannot merge {incoming} into {current}")]
    TypeMismatch {
        current: &'static str,
        incoming: &'static str,
    },

    #[error("merge rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec {codec} cannot encode value of type {type_name}")]
    WrongType {
        codec: String,
        type_name: &'static str,
    },

    #[error("codec {codec} failed: {source}")]
    Bincode {
        codec: String,
        #[source]
        source: bincode::Error,
    },
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to decode key/value pair: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("not enough data left for another key/value pair: need {needed} bytes, have {remaining}")]
    Truncated { needed: usize, remaining: usize },

    #[error("encoded key/value pair too large: {0} bytes")]
    TooLarge(usize),

    #[error("failed to encode membership message: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no bind address configured")]
    NoBindAddress,

    #[error("failed to parse advertise address {0:?}")]
    InvalidAdvertiseAddr(String),

    #[error("no private IP address found, and explicit IP not provided")]
    NoPrivateAddress,

    #[error("local address too long: {0}")]
    AddressTooLong(String),

    #[error("packet of {size} bytes exceeds the {limit} byte limit")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("timed out dialing {0}")]
    DialTimeout(String),

    #[error("unknown connection type {0}")]
    UnknownConnectionType(u8),

    #[error("transport is shutting down")]
    ShuttingDown,

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(KvError::VersionMismatch.is_retryable());
        assert!(KvError::NoChangeDetected.is_retryable());
        assert!(!KvError::TooManyRetries.is_retryable());
        assert!(!KvError::CodecNotFound("x".to_string()).is_retryable());
    }

    #[test]
    fn test_cas_failed_message_includes_key_and_cause() {
        let err = KvError::CasFailed {
            key: "ring".to_string(),
            source: Box::new(KvError::TooManyRetries),
        };
        assert_eq!(err.to_string(), "failed to CAS-update key ring: too many retries");
    }
}
