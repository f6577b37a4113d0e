//! Host → network rewriting

use std::time::Instant;

use super::{Relay, Verdict};
use crate::diag::{DiagCategory, DiagEvent, Severity};
use crate::error::Anomaly;
use crate::metrics::RelayMetrics;
use crate::packet::TcpSegment;
use crate::seq::{seq_distance, seq_lt, seq_offset};
use crate::state::{AckBounds, ConnectionKey, ConnectionState, Direction, RexmitEntry, SendSpace};

const DIR: Direction = Direction::Egress;

impl Relay {
    pub(super) fn egress(&self, mut segment: TcpSegment, raw: &[u8]) -> Verdict {
        let key = ConnectionKey::egress(&segment);
        let now = Instant::now();

        let (before, created) = self.table.get_or_create(key, now);
        if created {
            self.state_init(DIR, &key);
        }

        let flags = segment.flags();
        let dec_seq = segment.seq();
        let dec_ack = segment.ack();
        let len = segment.payload_len() as u32;

        self.trace(
            DIR,
            &key,
            format!(
                "SEG(SEQ={}, ACK={}, LEN={}) [{}] {}",
                dec_seq.wrapping_sub(before.dec.snd.iss),
                dec_ack.wrapping_sub(before.dec.rcv.irs),
                len,
                flags,
                before.describe()
            ),
        );

        if before.is_retransmission(dec_seq) {
            if let Some(entry) = before.rexmit.get(dec_seq).copied() {
                return self.egress_retransmission(&key, &before, entry, segment, raw, now);
            }
        }

        let mut state = before.clone();
        state.last_seen = now;
        let mut fresh = created;
        let flaginc = if flags.rst { 0 } else { flags.flaginc() };

        if flags.rst {
            // Torn down after forwarding
        } else if flags.syn {
            if before.host_syn && before.dec.snd.iss != dec_seq {
                state = self.session_reset(DIR, &key, &before, now);
                fresh = true;
            }
            state.dec.snd = SendSpace {
                iss: dec_seq,
                una: dec_seq,
                nxt: dec_seq.wrapping_add(1),
            };
            state.enc.snd = SendSpace {
                iss: dec_seq,
                una: dec_seq,
                nxt: dec_seq,
            };
            state.host_syn = true;
        } else if flags.fin {
            state.dec.snd.nxt = state.dec.snd.nxt.wrapping_add(flaginc);
        } else if created {
            self.report(
                DIR,
                &key,
                Anomaly::ProtocolAnomaly("closed host socket sending data".into()),
                Severity::Error,
            );
        }

        let mut bounds = AckBounds::default();
        if flags.ack {
            if let Some(wire_ack) = self.host_ack_to_wire(&key, &state, dec_ack, fresh) {
                segment.set_ack(wire_ack);
                bounds = AckBounds {
                    decrypted: Some(dec_ack),
                    encrypted: Some(wire_ack),
                };
            }
        }

        let expected = dec_seq.wrapping_add(flaginc);
        if state.dec.snd.nxt != expected {
            self.trace(
                DIR,
                &key,
                format!("SEG(SEQ) != SND.NXT [{:+}]", seq_distance(expected, state.dec.snd.nxt)),
            );
        }

        // Payload and sequence rewrite
        let wire_seq = state.enc.snd.nxt;
        segment.set_seq(wire_seq);

        if len > 0 {
            state.dec.snd.nxt = state.dec.snd.nxt.wrapping_add(len);

            let ciphertext = self.transform(DIR, &key, segment.payload());
            let hacklen = ciphertext.len() as isize - len as isize;
            segment.set_payload(ciphertext);

            state.enc.snd.nxt = seq_offset(state.enc.snd.nxt.wrapping_add(len), hacklen);
        }
        let wire_len = segment.payload_len() as u32;

        state.enc.ackchk.insert(
            wire_seq.wrapping_add(flaginc).wrapping_add(wire_len),
            dec_seq.wrapping_add(flaginc).wrapping_add(len),
        );
        state.enc.snd.nxt = state.enc.snd.nxt.wrapping_add(flaginc);
        state.rexmit.insert(
            dec_seq,
            RexmitEntry {
                ack: dec_ack,
                flags,
                wire_seq,
                len,
            },
        );

        // A host ack past a remote FIN closes the remote side
        if flags.ack && !state.remote_close {
            let wire_ack = segment.ack();
            if state.remote_special.iter().any(|(fin_seq, _)| seq_lt(fin_seq, wire_ack)) {
                state.remote_close = true;
                self.trace(DIR, &key, "host acknowledged remote FIN".into());
            }
        }

        let bytes = self.serialize(DIR, &key, &mut segment, raw);

        if flags.rst {
            self.close(DIR, &key, "host reset");
        } else {
            self.store(DIR, &key, &before, state, bounds);
        }

        self.trace(
            DIR,
            &key,
            format!(
                "HACK SEG(SEQ={:+}, ACK={:+}, LEN={:+}) [{}]",
                seq_distance(wire_seq, dec_seq),
                seq_distance(segment.ack(), dec_ack),
                wire_len as i64 - len as i64,
                flags
            ),
        );

        Verdict::Accept(bytes)
    }

    /// Replay a segment the host already sent, with its original wire seq
    fn egress_retransmission(
        &self,
        key: &ConnectionKey,
        state: &ConnectionState,
        entry: RexmitEntry,
        mut segment: TcpSegment,
        raw: &[u8],
        now: Instant,
    ) -> Verdict {
        RelayMetrics::incr(&self.metrics.retransmissions);
        self.trace(
            DIR,
            key,
            format!("REXMIT dec seq {} → wire seq {}", segment.seq(), entry.wire_seq),
        );

        segment.set_seq(entry.wire_seq);
        if segment.payload_len() > 0 {
            let ciphertext = self.transform(DIR, key, segment.payload());
            segment.set_payload(ciphertext);
        }

        let flags = segment.flags();
        if flags.ack {
            if let Some(wire_ack) = self.host_ack_to_wire(key, state, segment.ack(), false) {
                segment.set_ack(wire_ack);
            }
        }

        let bytes = self.serialize(DIR, key, &mut segment, raw);
        if flags.rst {
            self.close(DIR, key, "host reset");
        } else {
            self.table.touch(key, now);
        }
        Verdict::Accept(bytes)
    }

    /// Translate a host (decrypted) ack into wire space
    fn host_ack_to_wire(&self, key: &ConnectionKey, state: &ConnectionState, dec_ack: u32, brand_new: bool) -> Option<u32> {
        if dec_ack == state.dec.rcv.nxt {
            return Some(state.enc.rcv.nxt);
        }

        self.trace(
            DIR,
            key,
            format!("SEG(ACK) != RCV.NXT [{:+}]", seq_distance(dec_ack, state.dec.rcv.nxt)),
        );

        if let Some(&wire_ack) = state.dec.ackchk.get(dec_ack) {
            return Some(wire_ack);
        }

        if !brand_new {
            self.report(
                DIR,
                key,
                Anomaly::ProtocolAnomaly(format!(
                    "host ack {} not found in ackchk ({} entries)",
                    dec_ack,
                    state.dec.ackchk.len()
                )),
                Severity::Error,
            );
        } else {
            self.emit(
                DiagEvent::new(DiagCategory::Trace, Severity::Trace, "ack on fresh state left as-is")
                    .with_direction(DIR)
                    .with_key(*key),
            );
        }
        None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::diag::DiagCategory;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn test_length_accounting_passthrough() {
        let h = Harness::passthrough();
        h.handshake();

        let mut seq = 1001;
        for len in [1usize, 100, 1400, 7, 0, 512] {
            assert!(h.egress(seq, 5001, "PSH ACK", &vec![0x42; len]).is_accept());
            seq += len as u32;

            let state = h.state().unwrap();
            assert_eq!(
                state.enc.snd.nxt.wrapping_sub(state.enc.snd.iss),
                state.dec.snd.nxt.wrapping_sub(state.dec.snd.iss)
            );
        }
    }

    #[test]
    fn test_expansion_accounting() {
        let h = Harness::expanding();
        h.handshake();
        let pre = h.state().unwrap();

        let verdict = h.egress(1001, 5001, "PSH ACK", &[7u8; 50]);
        let seg = forwarded(&verdict);
        assert_eq!(seg.seq(), pre.enc.snd.nxt);
        assert_eq!(seg.payload_len(), 66);
        assert_eq!(&seg.payload()[50..], &TAG);

        let post = h.state().unwrap();
        assert_eq!(post.enc.snd.nxt, pre.enc.snd.nxt + 66);
        assert_eq!(post.dec.snd.nxt, pre.dec.snd.nxt + 50);
        assert_eq!(post.enc.ackchk.get(pre.enc.snd.nxt + 66), Some(&(1001 + 50)));
        let entry = post.rexmit.get(1001).unwrap();
        assert_eq!(entry.wire_seq, 1001);
        assert_eq!(entry.len, 50);
    }

    #[test]
    fn test_retransmission_is_idempotent() {
        let h = Harness::expanding();
        h.handshake();

        assert!(h.egress(1001, 5001, "PSH ACK", &[1u8; 50]).is_accept());
        let second = h.egress(1051, 5001, "PSH ACK", &[2u8; 50]);
        let wire_second = forwarded(&second).seq();
        let after_first_pass = h.state().unwrap();

        // Host retransmits the second segment
        let replay = h.egress(1051, 5001, "PSH ACK", &[2u8; 50]);
        let seg = forwarded(&replay);
        assert_eq!(seg.seq(), wire_second);
        assert_eq!(seg.payload_len(), 66);

        let state = h.state().unwrap();
        assert_eq!(state.dec.snd.nxt, after_first_pass.dec.snd.nxt);
        assert_eq!(state.enc.snd.nxt, after_first_pass.enc.snd.nxt);
        assert_eq!(h.relay.metrics().retransmissions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_syn_retransmission_keeps_iss() {
        let h = Harness::passthrough();
        assert!(h.egress(1000, 0, "SYN", b"").is_accept());
        let replay = h.egress(1000, 0, "SYN", b"");
        assert_eq!(forwarded(&replay).seq(), 1000);

        let state = h.state().unwrap();
        assert_eq!(state.dec.snd.nxt, 1001);
        assert_eq!(state.enc.snd.nxt, 1001);
    }

    #[test]
    fn test_data_on_fresh_state_is_anomaly() {
        let h = Harness::passthrough();
        let verdict = h.egress(7000, 0, "PSH", b"stray");
        assert!(verdict.is_accept());
        assert_eq!(h.sink.count(DiagCategory::Anomaly), 1);
        assert_eq!(h.sink.dumps().len(), 1);
    }

    #[test]
    fn test_unknown_host_ack_forwarded_unchanged() {
        let h = Harness::passthrough();
        h.handshake();

        let verdict = h.egress(1001, 4242, "ACK", b"");
        assert_eq!(forwarded(&verdict).ack(), 4242);
        assert_eq!(h.sink.count(DiagCategory::Anomaly), 1);
    }

    #[test]
    fn test_cipher_failure_forwards_plaintext() {
        let h = Harness::new(Arc::new(FailingCipher));
        h.handshake();

        let verdict = h.egress(1001, 5001, "PSH ACK", b"secret");
        let seg = forwarded(&verdict);
        assert_eq!(seg.payload(), b"secret");
        assert_eq!(h.sink.count(DiagCategory::CipherFailure), 1);
        assert_eq!(h.relay.metrics().cipher_failures.load(Ordering::Relaxed), 1);

        let state = h.state().unwrap();
        assert_eq!(state.enc.snd.nxt, 1007);
    }

    #[test]
    fn test_rewritten_packet_checksums_verify() {
        let h = Harness::expanding();
        h.handshake();

        let verdict = h.egress(1001, 5001, "PSH ACK", b"checksum me");
        let bytes = verdict.bytes().unwrap();

        let (ip, rest) = etherparse::Ipv4Header::from_slice(bytes).unwrap();
        assert_eq!(ip.header_checksum, ip.calc_header_checksum());

        let (tcp, payload) = etherparse::TcpHeader::from_slice(rest).unwrap();
        assert_eq!(payload.len(), "checksum me".len() + TAG.len());
        assert_eq!(tcp.checksum, tcp.calc_checksum_ipv4(&ip, payload).unwrap());
    }
}
