//! Network → host rewriting

use std::time::Instant;

use super::{Relay, Verdict};
use crate::diag::Severity;
use crate::error::Anomaly;
use crate::metrics::RelayMetrics;
use crate::packet::TcpSegment;
use crate::seq::{seq_distance, seq_gt};
use crate::state::{AckBounds, ConnectionKey, ConnectionState, Direction, RecvSpace, RemoteControl};

const DIR: Direction = Direction::Ingress;

/// Where an ingress segment sits relative to `enc.rcv.nxt`
#[derive(Debug, Clone, Copy)]
enum Placement {
    /// Next expected segment; carries its decrypted sequence number
    InOrder(u32),
    /// Already seen; decrypted sequence recovered from `unachk`
    Duplicate(u32),
}

impl Relay {
    pub(super) fn ingress(&self, mut segment: TcpSegment, raw: &[u8]) -> Verdict {
        let key = ConnectionKey::ingress(&segment);
        let now = Instant::now();

        let (before, created) = self.table.get_or_create(key, now);
        if created {
            self.state_init(DIR, &key);
        }

        let flags = segment.flags();
        let wire_seq = segment.seq();
        let wire_ack = segment.ack();
        let wire_len = segment.payload_len() as u32;

        self.trace(
            DIR,
            &key,
            format!(
                "SEG(SEQ={}, ACK={}, LEN={}) [{}] {}",
                wire_seq.wrapping_sub(before.enc.rcv.irs),
                wire_ack.wrapping_sub(before.enc.snd.iss),
                wire_len,
                flags,
                before.describe()
            ),
        );

        if flags.rst {
            return self.ingress_reset(&key, &before, segment, raw);
        }

        let mut state = before.clone();
        state.last_seen = now;
        let flaginc = flags.flaginc();
        let mut brand_new = created;

        if flags.syn {
            if before.remote_syn && before.enc.rcv.irs != wire_seq {
                state = self.session_reset(DIR, &key, &before, now);
                brand_new = true;
            }
            let space = RecvSpace {
                irs: wire_seq,
                nxt: wire_seq,
            };
            state.enc.rcv = space;
            state.dec.rcv = space;
            state.remote_syn = true;
            if !flags.ack {
                brand_new = true;
            }
        } else if flags.fin {
            state.remote_special.insert(
                wire_seq.wrapping_add(wire_len),
                RemoteControl {
                    ack: wire_ack,
                    flags,
                },
            );
            self.trace(DIR, &key, "remote closing".into());
        } else if created {
            self.trace(DIR, &key, "segment for unknown connection".into());
        }

        let placement = match self.place(&key, &state, wire_seq) {
            Ok(placement) => placement,
            Err(anomaly) => {
                self.report(DIR, &key, anomaly, Severity::Error);
                if created {
                    self.table.remove(&key);
                    RelayMetrics::incr(&self.metrics.connections_closed);
                }
                return Verdict::Drop;
            }
        };

        let dec_seq = match placement {
            Placement::InOrder(dec_seq) => {
                state.enc.unachk.insert(wire_seq, dec_seq);
                state.enc.rcv.nxt = wire_seq.wrapping_add(wire_len);
                dec_seq
            }
            Placement::Duplicate(dec_seq) => {
                RelayMetrics::incr(&self.metrics.duplicates);
                self.trace(DIR, &key, "old/repeat segment resolved from unachk".into());
                dec_seq
            }
        };
        let duplicate = matches!(placement, Placement::Duplicate(_));
        segment.set_seq(dec_seq);

        if flags.ack {
            self.track_remote_ack(&key, &mut state, wire_ack);
        }

        // Payload
        let mut plain_len = wire_len;
        if wire_len > 0 {
            let plaintext = self.transform(DIR, &key, segment.payload());
            plain_len = plaintext.len() as u32;
            segment.set_payload(plaintext);
            if !duplicate {
                state.dec.rcv.nxt = state.dec.rcv.nxt.wrapping_add(plain_len);
            }
        }

        let mut bounds = AckBounds::default();
        if flags.ack {
            match state.enc.ackchk.get(wire_ack).copied() {
                Some(dec_ack) => {
                    segment.set_ack(dec_ack);
                    bounds = AckBounds {
                        decrypted: Some(dec_ack),
                        encrypted: Some(wire_ack),
                    };
                }
                None if !brand_new => self.report(
                    DIR,
                    &key,
                    Anomaly::ProtocolAnomaly(format!(
                        "remote ack {} not found in ackchk ({} entries)",
                        wire_ack,
                        state.enc.ackchk.len()
                    )),
                    Severity::Error,
                ),
                None => {}
            }
        }

        if !duplicate {
            state.dec.rcv.nxt = state.dec.rcv.nxt.wrapping_add(flaginc);
            state.enc.rcv.nxt = state.enc.rcv.nxt.wrapping_add(flaginc);
            state.dec.ackchk.insert(
                dec_seq.wrapping_add(flaginc).wrapping_add(plain_len),
                wire_seq.wrapping_add(flaginc).wrapping_add(wire_len),
            );
        }

        // A remote ack past a host FIN closes the host side
        if flags.ack && bounds.decrypted.is_some() && !state.host_close {
            let dec_ack = segment.ack();
            if state.rexmit.iter().any(|(seq, entry)| entry.fin_acked_by(seq, dec_ack)) {
                state.host_close = true;
                self.trace(DIR, &key, "remote acknowledged host FIN".into());
            }
        }

        let bytes = self.serialize(DIR, &key, &mut segment, raw);

        if duplicate {
            self.table.touch(&key, now);
        } else {
            self.store(DIR, &key, &before, state, bounds);
        }

        self.trace(
            DIR,
            &key,
            format!(
                "HACK SEG(SEQ={:+}, ACK={:+}, LEN={:+}) [{}]",
                seq_distance(dec_seq, wire_seq),
                seq_distance(segment.ack(), wire_ack),
                plain_len as i64 - wire_len as i64,
                flags
            ),
        );

        Verdict::Accept(bytes)
    }

    /// Classify `wire_seq` against the expected receive sequence
    fn place(&self, key: &ConnectionKey, state: &ConnectionState, wire_seq: u32) -> Result<Placement, Anomaly> {
        let expected = state.enc.rcv.nxt;
        if wire_seq == expected {
            return Ok(Placement::InOrder(state.dec.rcv.nxt));
        }

        let distance = seq_distance(wire_seq, expected);
        if seq_gt(wire_seq, expected) {
            return Err(Anomaly::OutOfOrderSegment { distance });
        }

        match state.enc.unachk.get(wire_seq) {
            Some(&dec_seq) => {
                self.trace(DIR, key, format!("SEG(SEQ) behind RCV.NXT [{:+}]", distance));
                Ok(Placement::Duplicate(dec_seq))
            }
            None => Err(Anomaly::UnresolvableDuplicate { distance }),
        }
    }

    /// Advance `enc.snd.una` and flag suspicious remote acks
    fn track_remote_ack(&self, key: &ConnectionKey, state: &mut ConnectionState, wire_ack: u32) {
        let una = state.enc.snd.una;
        if seq_gt(wire_ack, una) {
            state.enc.snd.una = wire_ack;
        } else if wire_ack == una {
            if una == state.enc.snd.nxt {
                self.trace(DIR, key, "SEG(ACK) no new data to ack".into());
            } else {
                self.report(
                    DIR,
                    key,
                    Anomaly::ProtocolAnomaly(format!("duplicate ack {}", wire_ack)),
                    Severity::Warn,
                );
            }
        } else {
            self.report(
                DIR,
                key,
                Anomaly::ProtocolAnomaly(format!(
                    "ack decreased by {}",
                    seq_distance(una, wire_ack)
                )),
                Severity::Warn,
            );
        }
    }

    /// Forward a remote RST with best-effort translation, then tear down
    fn ingress_reset(&self, key: &ConnectionKey, state: &ConnectionState, mut segment: TcpSegment, raw: &[u8]) -> Verdict {
        let wire_seq = segment.seq();
        if wire_seq == state.enc.rcv.nxt {
            segment.set_seq(state.dec.rcv.nxt);
        } else if let Some(&dec_seq) = state.enc.unachk.get(wire_seq) {
            segment.set_seq(dec_seq);
        }

        if segment.flags().ack {
            if let Some(&dec_ack) = state.enc.ackchk.get(segment.ack()) {
                segment.set_ack(dec_ack);
            }
        }

        let bytes = self.serialize(DIR, key, &mut segment, raw);
        self.close(DIR, key, "remote reset");
        Verdict::Accept(bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
