//! Error types for the relay
//!
//! None of these reach an interactive user. Packet-path failures degrade to
//! best-effort forwarding plus a diagnostic; only malformed input and
//! ordering violations turn into a DROP verdict.

use thiserror::Error;

/// Failure to interpret or re-serialize an intercepted packet
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated ({0} bytes)")]
    Truncated(usize),
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),
    #[error("not a TCP segment (protocol {0})")]
    NotTcp(u8),
    #[error("fragmented IPv4 datagram")]
    Fragmented,
    #[error("malformed header: {0}")]
    Malformed(String),
    #[error("rewritten packet too large ({0} bytes)")]
    TooLarge(usize),
}

/// Failure reported by a [`crate::cipher::Cipher`] implementation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("ciphertext frame too short ({0} bytes)")]
    FrameTooShort(usize),
    #[error("authentication failed")]
    Unauthenticated,
    #[error("invalid key length {0}")]
    InvalidKey(usize),
    #[error("random source unavailable")]
    Random,
}

/// Failure to load a [`crate::config::RelayConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    Invalid(&'static str),
}

/// Per-packet anomaly taxonomy reported to the diagnostic sink
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Sequence/ack mismatch that no translation cache could resolve
    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(String),
    /// Ingress segment ahead of the expected wire sequence; dropped
    #[error("out-of-order segment {distance:+} bytes ahead of rcv.nxt")]
    OutOfOrderSegment { distance: i64 },
    /// Ingress segment behind the expected wire sequence with no unachk entry
    #[error("unresolvable duplicate {distance:+} bytes behind rcv.nxt")]
    UnresolvableDuplicate { distance: i64 },
    /// Cipher call failed; payload forwarded unmodified
    #[error("cipher failure: {0}")]
    CipherFailure(#[from] CipherError),
    /// State entry deleted between lookup and merge
    #[error("connection state removed before merge")]
    StateRace,
}
