//! Per-connection rewriting state
//!
//! Every TCP connection crossing the relay is tracked twice: once in wire
//! (encrypted) sequence space and once in the space the protected host's TCP
//! stack believes in (decrypted). The translation caches map numbers between
//! the two spaces for segments that do not line up with the current
//! "expected next" pointers.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

use crate::packet::{TcpFlags, TcpSegment};
use crate::seq::{seq_gt, seq_le, SeqMap};

// ============================================================================
// Connection Key
// ============================================================================

/// Identifies a connection from the protected host's point of view.
///
/// Egress packets map (src, dst) to (local, remote); ingress packets map
/// (dst, src) to (local, remote), so both directions share one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
}

impl ConnectionKey {
    pub fn new(local_addr: Ipv4Addr, local_port: u16, remote_addr: Ipv4Addr, remote_port: u16) -> Self {
        ConnectionKey {
            local_addr,
            local_port,
            remote_addr,
            remote_port,
        }
    }

    /// Key for a segment leaving the protected host
    pub fn egress(segment: &TcpSegment) -> Self {
        Self::new(
            segment.src_addr(),
            segment.src_port(),
            segment.dst_addr(),
            segment.dst_port(),
        )
    }

    /// Key for a segment arriving at the protected host
    pub fn ingress(segment: &TcpSegment) -> Self {
        Self::new(
            segment.dst_addr(),
            segment.dst_port(),
            segment.src_addr(),
            segment.src_port(),
        )
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.local_addr, self.local_port, self.remote_addr, self.remote_port
        )
    }
}

/// Traffic direction relative to the protected host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host → network (encrypt)
    Egress,
    /// Network → host (decrypt)
    Ingress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Egress => f.write_str("egress"),
            Direction::Ingress => f.write_str("ingress"),
        }
    }
}

// ============================================================================
// Sequence Spaces
// ============================================================================

/// Send sequence variables (RFC 793 §3.2)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendSpace {
    /// Oldest unacknowledged sequence number
    pub una: u32,
    /// Next sequence number to send
    pub nxt: u32,
    /// Initial send sequence number
    pub iss: u32,
}

/// Receive sequence variables (RFC 793 §3.2)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvSpace {
    /// Initial receive sequence number
    pub irs: u32,
    /// Next sequence number expected
    pub nxt: u32,
}

/// Bookkeeping in wire (encrypted) space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireSpace {
    pub snd: SendSpace,
    pub rcv: RecvSpace,
    /// Wire receive seq → decrypted receive seq, for old/duplicate segments
    pub unachk: SeqMap<u32>,
    /// Wire segment end → decrypted segment end, for remote ACKs
    pub ackchk: SeqMap<u32>,
}

/// Bookkeeping in the host's (decrypted) space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlainSpace {
    pub snd: SendSpace,
    pub rcv: RecvSpace,
    /// Decrypted receive end → wire receive end, for host ACKs
    pub ackchk: SeqMap<u32>,
}

/// Record of a segment the host sent, keyed by its decrypted sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RexmitEntry {
    /// Decrypted ack carried by the original segment
    pub ack: u32,
    pub flags: TcpFlags,
    /// Wire sequence number the segment was first sent with
    pub wire_seq: u32,
    /// Plaintext payload length
    pub len: u32,
}

impl RexmitEntry {
    /// Whether `ack` (decrypted) acknowledges the FIN carried by this segment
    /// sent at decrypted sequence `seq`.
    pub fn fin_acked_by(&self, seq: u32, ack: u32) -> bool {
        self.flags.fin && seq_gt(ack, seq.wrapping_add(self.len))
    }
}

/// Remote control segment (FIN) waiting for the host's ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteControl {
    pub ack: u32,
    pub flags: TcpFlags,
}

// ============================================================================
// Connection Phase
// ============================================================================

/// Lifecycle phase derived from the close bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Not both SYNs observed yet
    Init,
    Established,
    /// Host FIN outstanding or acknowledged, remote still open
    HostFinSent,
    /// Remote FIN outstanding or acknowledged, host still open
    RemoteFinSent,
    /// Both sides sent FIN, not both acknowledged yet
    Closing,
    Closed,
}

// ============================================================================
// Connection State
// ============================================================================

/// Lower bounds used to prune translation caches on merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckBounds {
    /// Lowest still-relevant ack in decrypted space
    pub decrypted: Option<u32>,
    /// Lowest still-relevant ack in wire space
    pub encrypted: Option<u32>,
}

/// Rewriting context for one TCP connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub enc: WireSpace,
    pub dec: PlainSpace,
    pub rexmit: SeqMap<RexmitEntry>,
    /// Remote FINs keyed by the wire sequence position the FIN occupies
    pub remote_special: SeqMap<RemoteControl>,
    pub host_close: bool,
    pub remote_close: bool,
    pub host_syn: bool,
    pub remote_syn: bool,
    /// Bumped when a new SYN reuses the key; tracking restarts from scratch
    pub session: u32,
    /// Version counter for optimistic merges
    pub last_update: u64,
    pub last_seen: Instant,
}

impl ConnectionState {
    /// Fresh zeroed state
    pub fn new(now: Instant) -> Self {
        ConnectionState {
            enc: WireSpace::default(),
            dec: PlainSpace::default(),
            rexmit: SeqMap::new(),
            remote_special: SeqMap::new(),
            host_close: false,
            remote_close: false,
            host_syn: false,
            remote_syn: false,
            session: 0,
            last_update: 0,
            last_seen: now,
        }
    }

    /// Fresh state for a new connection reusing this key.
    ///
    /// Keeps the version so the result still stores against the snapshot it
    /// was derived from.
    pub fn next_session(&self, now: Instant) -> Self {
        ConnectionState {
            session: self.session.wrapping_add(1),
            last_update: self.last_update,
            ..ConnectionState::new(now)
        }
    }

    /// Both sides have closed
    pub fn is_closed(&self) -> bool {
        self.host_close && self.remote_close
    }

    pub fn phase(&self) -> ConnectionPhase {
        if self.is_closed() {
            return ConnectionPhase::Closed;
        }

        let host_fin = self.host_close || self.rexmit.iter().any(|(_, e)| e.flags.fin);
        let remote_fin = self.remote_close || !self.remote_special.is_empty();

        match (host_fin, remote_fin) {
            (true, true) => ConnectionPhase::Closing,
            (true, false) => ConnectionPhase::HostFinSent,
            (false, true) => ConnectionPhase::RemoteFinSent,
            (false, false) if self.host_syn && self.remote_syn => ConnectionPhase::Established,
            (false, false) => ConnectionPhase::Init,
        }
    }

    /// Drop translation entries the acknowledgments have made irrelevant.
    ///
    /// Each direction prunes the caches whose keys live in the space its ack
    /// bound describes.
    pub fn prune(&mut self, direction: Direction, bounds: AckBounds) {
        match direction {
            Direction::Egress => {
                if let Some(dec_ack) = bounds.decrypted {
                    self.dec.ackchk.prune_below(dec_ack);
                }
                if let Some(enc_ack) = bounds.encrypted {
                    self.enc.unachk.prune_below(enc_ack);
                    self.remote_special.prune_below(enc_ack);
                }
            }
            Direction::Ingress => {
                if let Some(enc_ack) = bounds.encrypted {
                    self.enc.ackchk.prune_below(enc_ack);
                }
                if let Some(dec_ack) = bounds.decrypted {
                    self.rexmit.prune_below(dec_ack);
                }
            }
        }
    }

    /// Reconcile `local` (mutated by `direction` from an older snapshot)
    /// against `stored`, which another worker updated in the meantime.
    ///
    /// A newer session replaces an older one outright. Within a session,
    /// sequence spaces keep whichever copy advanced further, flags are
    /// OR-ed, and caches are unioned with the writing direction's copy
    /// winning conflicts. A send space is only initialised by a host SYN and
    /// a receive space by a remote SYN; an uninitialised copy never wins.
    pub fn merge(stored: &ConnectionState, local: &ConnectionState, direction: Direction) -> ConnectionState {
        if local.session != stored.session {
            let newer = if (local.session.wrapping_sub(stored.session) as i32) > 0 {
                local
            } else {
                stored
            };
            return ConnectionState {
                last_update: stored.last_update,
                last_seen: stored.last_seen.max(local.last_seen),
                ..newer.clone()
            };
        }

        fn keep_stored(stored_init: bool, stored_nxt: u32, local_init: bool, local_nxt: u32) -> bool {
            match (stored_init, local_init) {
                (true, false) => true,
                (false, true) => false,
                _ => seq_gt(stored_nxt, local_nxt),
            }
        }
        let further_snd = |stored_snd: SendSpace, local_snd: SendSpace| {
            if keep_stored(stored.host_syn, stored_snd.nxt, local.host_syn, local_snd.nxt) {
                stored_snd
            } else {
                local_snd
            }
        };
        let further_rcv = |stored_rcv: RecvSpace, local_rcv: RecvSpace| {
            if keep_stored(stored.remote_syn, stored_rcv.nxt, local.remote_syn, local_rcv.nxt) {
                stored_rcv
            } else {
                local_rcv
            }
        };

        // Egress writes enc.ackchk and rexmit; ingress writes the rest
        let egress = direction == Direction::Egress;
        let (egress_side, ingress_side) = if egress { (local, stored) } else { (stored, local) };

        ConnectionState {
            enc: WireSpace {
                snd: further_snd(stored.enc.snd, local.enc.snd),
                rcv: further_rcv(stored.enc.rcv, local.enc.rcv),
                unachk: SeqMap::merged(&ingress_side.enc.unachk, &egress_side.enc.unachk),
                ackchk: SeqMap::merged(&egress_side.enc.ackchk, &ingress_side.enc.ackchk),
            },
            dec: PlainSpace {
                snd: further_snd(stored.dec.snd, local.dec.snd),
                rcv: further_rcv(stored.dec.rcv, local.dec.rcv),
                ackchk: SeqMap::merged(&ingress_side.dec.ackchk, &egress_side.dec.ackchk),
            },
            rexmit: SeqMap::merged(&egress_side.rexmit, &ingress_side.rexmit),
            remote_special: SeqMap::merged(&ingress_side.remote_special, &egress_side.remote_special),
            host_close: stored.host_close || local.host_close,
            remote_close: stored.remote_close || local.remote_close,
            host_syn: stored.host_syn || local.host_syn,
            remote_syn: stored.remote_syn || local.remote_syn,
            session: stored.session,
            last_update: stored.last_update,
            last_seen: stored.last_seen.max(local.last_seen),
        }
    }

    /// One-line dump for trace logging, sequence numbers relative to the
    /// initial sequence numbers
    pub fn describe(&self) -> String {
        let rel = |seq: u32, base: u32| seq.wrapping_sub(base);
        format!(
            "enc snd(una={} nxt={}) rcv(nxt={}) | dec snd(una={} nxt={}) rcv(nxt={}) | \
             rexmit={} unachk={} enc.ackchk={} dec.ackchk={} special={} | close host={} remote={}",
            rel(self.enc.snd.una, self.enc.snd.iss),
            rel(self.enc.snd.nxt, self.enc.snd.iss),
            rel(self.enc.rcv.nxt, self.enc.rcv.irs),
            rel(self.dec.snd.una, self.dec.snd.iss),
            rel(self.dec.snd.nxt, self.dec.snd.iss),
            rel(self.dec.rcv.nxt, self.dec.rcv.irs),
            self.rexmit.len(),
            self.enc.unachk.len(),
            self.enc.ackchk.len(),
            self.dec.ackchk.len(),
            self.remote_special.len(),
            self.host_close,
            self.remote_close,
        )
    }

    /// Whether `seq` is a retransmission of something already sent
    pub fn is_retransmission(&self, seq: u32) -> bool {
        self.rexmit.contains(seq) && !seq_le(self.dec.snd.nxt, seq)
    }
}

// ============================================================================
// Tests
// ============================================================================
