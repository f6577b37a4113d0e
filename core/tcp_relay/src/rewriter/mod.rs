//! Segment rewriting for both traffic directions
//!
//! [`Relay`] owns the shared connection table, the payload cipher and the
//! diagnostics pipeline. Each call takes one raw IPv4 packet from a capture
//! queue and returns the verdict for it:
//! - egress (host → network): encrypt payload, move seq into wire space,
//!   move ack from host space into wire space
//! - ingress (network → host): decrypt payload, move seq into host space,
//!   move ack from wire space into host space

mod egress;
mod ingress;

use std::sync::Arc;
use std::time::Instant;

use crate::cipher::Cipher;
use crate::config::RelayConfig;
use crate::diag::{DiagCategory, DiagEvent, DiagnosticSink, Diagnostics, Severity};
use crate::error::{Anomaly, PacketError};
use crate::metrics::RelayMetrics;
use crate::packet::TcpSegment;
use crate::state::{AckBounds, ConnectionKey, ConnectionState, Direction};
use crate::table::{ConnectionTable, MergeOutcome, SharedConnectionTable};

/// Decision for one intercepted packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Forward these bytes in place of the original packet
    Accept(Vec<u8>),
    Drop,
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept(_))
    }

    /// Forwarded bytes, if accepted
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Verdict::Accept(bytes) => Some(bytes),
            Verdict::Drop => None,
        }
    }
}

/// Stateful TCP rewriting relay
pub struct Relay {
    config: RelayConfig,
    table: Arc<dyn ConnectionTable>,
    cipher: Arc<dyn Cipher>,
    diag: Diagnostics,
    metrics: Arc<RelayMetrics>,
}

impl Relay {
    /// Relay with a private connection table and metrics
    pub fn new(config: RelayConfig, cipher: Arc<dyn Cipher>, sink: Arc<dyn DiagnosticSink>) -> Self {
        let table = Arc::new(SharedConnectionTable::new(config.merge_retries));
        Self::with_parts(config, table, cipher, sink, Arc::new(RelayMetrics::new()))
    }

    pub fn with_parts(
        config: RelayConfig,
        table: Arc<dyn ConnectionTable>,
        cipher: Arc<dyn Cipher>,
        sink: Arc<dyn DiagnosticSink>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let diag = Diagnostics::new(sink, config.diag_backlog);
        Relay {
            config,
            table,
            cipher,
            diag,
            metrics,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<dyn ConnectionTable> {
        &self.table
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    /// Process one packet from the egress queue
    pub fn handle_egress(&self, data: &[u8]) -> Verdict {
        RelayMetrics::incr(&self.metrics.egress_packets);
        let verdict = match self.classify(data, Direction::Egress) {
            Ok(segment) => self.egress(segment, data),
            Err(verdict) => verdict,
        };
        self.count_verdict(&verdict);
        verdict
    }

    /// Process one packet from the ingress queue
    pub fn handle_ingress(&self, data: &[u8]) -> Verdict {
        RelayMetrics::incr(&self.metrics.ingress_packets);
        let verdict = match self.classify(data, Direction::Ingress) {
            Ok(segment) => self.ingress(segment, data),
            Err(verdict) => verdict,
        };
        self.count_verdict(&verdict);
        verdict
    }

    /// Evict connections idle for longer than the configured timeout
    pub fn evict_idle(&self) -> Vec<ConnectionKey> {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> Vec<ConnectionKey> {
        let evicted = self.table.evict_idle(now, self.config.idle_timeout());
        for key in &evicted {
            RelayMetrics::incr(&self.metrics.connections_evicted);
            self.emit(
                DiagEvent::new(DiagCategory::Evicted, Severity::Info, "idle timeout, state evicted")
                    .with_key(*key),
            );
        }
        evicted
    }

    // ------------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------------

    /// Parse, or decide the verdict for packets the relay does not rewrite
    fn classify(&self, data: &[u8], direction: Direction) -> Result<TcpSegment, Verdict> {
        match TcpSegment::parse(data) {
            Ok(segment) => Ok(segment),
            Err(err @ (PacketError::NotIpv4(_) | PacketError::NotTcp(_) | PacketError::Fragmented)) => {
                RelayMetrics::incr(&self.metrics.passthrough);
                self.emit(
                    DiagEvent::new(DiagCategory::Trace, Severity::Trace, format!("passthrough: {}", err))
                        .with_direction(direction),
                );
                Err(Verdict::Accept(data.to_vec()))
            }
            Err(err) => {
                self.emit(
                    DiagEvent::new(DiagCategory::Drop, Severity::Warn, format!("unparseable packet: {}", err))
                        .with_direction(direction),
                );
                Err(Verdict::Drop)
            }
        }
    }

    fn count_verdict(&self, verdict: &Verdict) {
        match verdict {
            Verdict::Accept(_) => RelayMetrics::incr(&self.metrics.accepted),
            Verdict::Drop => RelayMetrics::incr(&self.metrics.dropped),
        }
    }

    fn emit(&self, event: DiagEvent) {
        self.diag.emit(event);
    }

    fn trace(&self, direction: Direction, key: &ConnectionKey, message: String) {
        self.emit(
            DiagEvent::new(DiagCategory::Trace, Severity::Trace, message)
                .with_direction(direction)
                .with_key(*key),
        );
    }

    /// Record an anomaly under its category and bump its counter
    fn report(&self, direction: Direction, key: &ConnectionKey, anomaly: Anomaly, severity: Severity) {
        let category = match anomaly {
            Anomaly::CipherFailure(_) => {
                RelayMetrics::incr(&self.metrics.cipher_failures);
                DiagCategory::CipherFailure
            }
            Anomaly::StateRace => {
                RelayMetrics::incr(&self.metrics.state_races);
                DiagCategory::StateRace
            }
            Anomaly::OutOfOrderSegment { .. } | Anomaly::UnresolvableDuplicate { .. } => {
                RelayMetrics::incr(&self.metrics.anomalies);
                DiagCategory::Drop
            }
            Anomaly::ProtocolAnomaly(_) => {
                RelayMetrics::incr(&self.metrics.anomalies);
                DiagCategory::Anomaly
            }
        };
        self.emit(
            DiagEvent::new(category, severity, anomaly.to_string())
                .with_direction(direction)
                .with_key(*key),
        );
    }

    fn state_init(&self, direction: Direction, key: &ConnectionKey) {
        RelayMetrics::incr(&self.metrics.connections_opened);
        self.emit(
            DiagEvent::new(DiagCategory::StateInit, Severity::Info, "initializing connection state")
                .with_direction(direction)
                .with_key(*key),
        );
    }

    /// A new SYN on a key still tracked for an earlier connection. The old
    /// bookkeeping is dropped wholesale so none of its caches or prune floors
    /// leak into the new connection.
    fn session_reset(&self, direction: Direction, key: &ConnectionKey, before: &ConnectionState, now: Instant) -> ConnectionState {
        RelayMetrics::incr(&self.metrics.connections_closed);
        RelayMetrics::incr(&self.metrics.connections_opened);
        self.emit(
            DiagEvent::new(
                DiagCategory::StateInit,
                Severity::Info,
                format!("session reset, new SYN replaces session {}", before.session),
            )
            .with_direction(direction)
            .with_key(*key),
        );
        before.next_session(now)
    }

    /// Run the payload through the cipher; on failure forward it unmodified
    fn transform(&self, direction: Direction, key: &ConnectionKey, payload: &[u8]) -> Vec<u8> {
        if !self.config.encryption_enabled {
            return payload.to_vec();
        }

        let result = match direction {
            Direction::Egress => self.cipher.encrypt(payload),
            Direction::Ingress => self.cipher.decrypt(payload),
        };
        match result {
            Ok(out) => out,
            Err(err) => {
                self.report(direction, key, Anomaly::CipherFailure(err), Severity::Warn);
                payload.to_vec()
            }
        }
    }

    /// Serialize the rewritten segment, falling back to the original bytes
    fn serialize(&self, direction: Direction, key: &ConnectionKey, segment: &mut TcpSegment, original: &[u8]) -> Vec<u8> {
        match segment.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.report(
                    direction,
                    key,
                    Anomaly::ProtocolAnomaly(format!("re-serialization failed: {}", err)),
                    Severity::Error,
                );
                original.to_vec()
            }
        }
    }

    /// Remove a connection closed by RST or FIN exchange
    fn close(&self, direction: Direction, key: &ConnectionKey, reason: &str) {
        if self.table.remove(key) {
            RelayMetrics::incr(&self.metrics.connections_closed);
            self.emit(
                DiagEvent::new(DiagCategory::Close, Severity::Info, reason.to_string())
                    .with_direction(direction)
                    .with_key(*key),
            );
        }
    }

    /// Hand the rewritten state back to the table
    fn store(
        &self,
        direction: Direction,
        key: &ConnectionKey,
        before: &ConnectionState,
        after: ConnectionState,
        bounds: AckBounds,
    ) {
        if after.is_closed() {
            self.close(direction, key, "both sides closed");
            return;
        }

        match self.table.merge_and_store(key, before, after, direction, bounds) {
            MergeOutcome::Stored { retries: 0 } => {}
            MergeOutcome::Stored { retries } => {
                self.trace(direction, key, format!("merged after {} version conflicts", retries));
            }
            MergeOutcome::Closed => {
                RelayMetrics::incr(&self.metrics.connections_closed);
                self.emit(
                    DiagEvent::new(DiagCategory::Close, Severity::Info, "both sides closed")
                        .with_direction(direction)
                        .with_key(*key),
                );
            }
            MergeOutcome::Missing => self.report(direction, key, Anomaly::StateRace, Severity::Warn),
        }
    }
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cipher::PassthroughCipher;
    use crate::diag::MemorySink;
    use crate::error::CipherError;
    use crate::packet::test_support::build_segment;
    use crate::packet::TcpFlags;
    use std::net::SocketAddrV4;

    /// Appends a fixed 16-byte tag; strips it on decrypt
    pub struct ExpandingCipher;

    pub const TAG: [u8; 16] = [0xAA; 16];

    impl Cipher for ExpandingCipher {
        fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
            let mut out = plaintext.to_vec();
            out.extend_from_slice(&TAG);
            Ok(out)
        }

        fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
            if ciphertext.len() < TAG.len() {
                return Err(CipherError::FrameTooShort(ciphertext.len()));
            }
            Ok(ciphertext[..ciphertext.len() - TAG.len()].to_vec())
        }
    }

    /// Fails every call
    pub struct FailingCipher;

    impl Cipher for FailingCipher {
        fn encrypt(&self, _: &[u8]) -> Result<Vec<u8>, CipherError> {
            Err(CipherError::Unauthenticated)
        }

        fn decrypt(&self, _: &[u8]) -> Result<Vec<u8>, CipherError> {
            Err(CipherError::Unauthenticated)
        }
    }

    pub fn host() -> SocketAddrV4 {
        "10.0.0.2:40000".parse().unwrap()
    }

    pub fn remote() -> SocketAddrV4 {
        "192.168.1.100:443".parse().unwrap()
    }

    pub fn flags(names: &str) -> TcpFlags {
        let mut flags = TcpFlags::default();
        for name in names.split_whitespace() {
            match name {
                "SYN" => flags.syn = true,
                "ACK" => flags.ack = true,
                "FIN" => flags.fin = true,
                "RST" => flags.rst = true,
                "PSH" => flags.psh = true,
                other => panic!("unknown flag {}", other),
            }
        }
        flags
    }

    /// Relay plus memory sink with packet shorthands
    pub struct Harness {
        pub relay: Relay,
        pub sink: Arc<MemorySink>,
    }

    impl Harness {
        pub fn new(cipher: Arc<dyn Cipher>) -> Self {
            let sink = Arc::new(MemorySink::new());
            let relay = Relay::new(RelayConfig::default(), cipher, sink.clone());
            Harness { relay, sink }
        }

        pub fn passthrough() -> Self {
            Self::new(Arc::new(PassthroughCipher))
        }

        pub fn expanding() -> Self {
            Self::new(Arc::new(ExpandingCipher))
        }

        pub fn key() -> ConnectionKey {
            ConnectionKey::new(*host().ip(), host().port(), *remote().ip(), remote().port())
        }

        pub fn state(&self) -> Option<ConnectionState> {
            self.relay.table().snapshot(&Self::key())
        }

        /// Host → network
        pub fn egress(&self, seq: u32, ack: u32, names: &str, payload: &[u8]) -> Verdict {
            let f = flags(names);
            let ack = if f.ack { Some(ack) } else { None };
            self.relay
                .handle_egress(&build_segment(host(), remote(), seq, ack, f, payload))
        }

        /// Network → host
        pub fn ingress(&self, seq: u32, ack: u32, names: &str, payload: &[u8]) -> Verdict {
            let f = flags(names);
            let ack = if f.ack { Some(ack) } else { None };
            self.relay
                .handle_ingress(&build_segment(remote(), host(), seq, ack, f, payload))
        }

        /// Three-way handshake: host iss 1000, remote iss 5000
        pub fn handshake(&self) {
            assert!(self.egress(1000, 0, "SYN", b"").is_accept());
            assert!(self.ingress(5000, 1001, "SYN ACK", b"").is_accept());
            assert!(self.egress(1001, 5001, "ACK", b"").is_accept());
        }
    }

    /// Parse forwarded bytes back into a segment
    pub fn forwarded(verdict: &Verdict) -> TcpSegment {
        let bytes = verdict.bytes().expect("packet was dropped");
        TcpSegment::parse(bytes).expect("forwarded packet does not parse")
    }
}

// ============================================================================
// Tests
// ============================================================================
