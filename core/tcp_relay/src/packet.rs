//! IPv4/TCP segment parsing and re-serialization
//!
//! The capture layer hands over raw IPv4 packets. [`TcpSegment`] holds the
//! decoded headers and an owned payload so the rewriter can swap sequence
//! numbers and ciphertext in place, then serializes the result with fresh
//! length fields and checksums (calculated by etherparse).

use std::fmt;
use std::net::Ipv4Addr;

use etherparse::{IpNumber, Ipv4Header, TcpHeader};

use crate::error::PacketError;

/// Minimum IPv4 header length
const IPV4_MIN_HEADER_LEN: usize = 20;

/// Largest value the IPv4 total length field can carry
const IPV4_MAX_TOTAL_LEN: usize = u16::MAX as usize;

// ============================================================================
// TCP Flags
// ============================================================================

/// TCP control flags of a segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    fn from_header(tcp: &TcpHeader) -> Self {
        TcpFlags {
            fin: tcp.fin,
            syn: tcp.syn,
            rst: tcp.rst,
            psh: tcp.psh,
            ack: tcp.ack,
            urg: tcp.urg,
            ece: tcp.ece,
            cwr: tcp.cwr,
        }
    }

    /// Number of sequence bytes the control flags occupy (SYN or FIN)
    pub fn flaginc(self) -> u32 {
        if self.syn || self.fin {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.fin, "FIN"),
            (self.syn, "SYN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.ack, "ACK"),
            (self.urg, "URG"),
            (self.ece, "ECE"),
            (self.cwr, "CWR"),
        ];

        let mut first = true;
        for (_, name) in names.iter().filter(|(set, _)| *set) {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

// ============================================================================
// TCP Segment
// ============================================================================

/// A decoded IPv4/TCP packet with an owned, replaceable payload
#[derive(Debug, Clone)]
pub struct TcpSegment {
    ip: Ipv4Header,
    tcp: TcpHeader,
    payload: Vec<u8>,
}

impl TcpSegment {
    /// Decode a raw IPv4 packet carrying a TCP segment.
    ///
    /// Bytes past the IPv4 total length are treated as link padding and
    /// ignored.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::Truncated(data.len()));
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(PacketError::NotIpv4(version));
        }

        let (ip, rest) =
            Ipv4Header::from_slice(data).map_err(|e| PacketError::Malformed(e.to_string()))?;

        if ip.is_fragmenting_payload() {
            return Err(PacketError::Fragmented);
        }
        if ip.protocol != IpNumber::TCP {
            return Err(PacketError::NotTcp(ip.protocol.0));
        }

        let header_len = ip.header_len();
        let total_len = usize::from(ip.total_len);
        if total_len < header_len || total_len > data.len() {
            return Err(PacketError::Malformed(format!(
                "total length {} with {} header bytes in {} byte buffer",
                total_len,
                header_len,
                data.len()
            )));
        }

        let ip_payload = &rest[..total_len - header_len];
        let (tcp, payload) =
            TcpHeader::from_slice(ip_payload).map_err(|e| PacketError::Malformed(e.to_string()))?;

        Ok(TcpSegment {
            ip,
            tcp,
            payload: payload.to_vec(),
        })
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip.source)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip.destination)
    }

    pub fn src_port(&self) -> u16 {
        self.tcp.source_port
    }

    pub fn dst_port(&self) -> u16 {
        self.tcp.destination_port
    }

    pub fn seq(&self) -> u32 {
        self.tcp.sequence_number
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.tcp.sequence_number = seq;
    }

    pub fn ack(&self) -> u32 {
        self.tcp.acknowledgment_number
    }

    pub fn set_ack(&mut self, ack: u32) {
        self.tcp.acknowledgment_number = ack;
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_header(&self.tcp)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Replace the TCP payload; lengths are fixed up on serialization
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Current IPv4 total length field
    pub fn ip_total_len(&self) -> u16 {
        self.ip.total_len
    }

    /// Serialize with recomputed IPv4 total length, header checksum and TCP
    /// checksum.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, PacketError> {
        let tcp_len = self.tcp.header_len() as usize + self.payload.len();
        let total_len = self.ip.header_len() + tcp_len;
        if total_len > IPV4_MAX_TOTAL_LEN {
            return Err(PacketError::TooLarge(total_len));
        }

        self.ip
            .set_payload_len(tcp_len)
            .map_err(|_| PacketError::TooLarge(total_len))?;
        self.ip.header_checksum = self.ip.calc_header_checksum();
        self.tcp.checksum = self
            .tcp
            .calc_checksum_ipv4(&self.ip, &self.payload)
            .map_err(|_| PacketError::TooLarge(total_len))?;

        let mut out = Vec::with_capacity(total_len);
        self.ip
            .write(&mut out)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;
        self.tcp
            .write(&mut out)
            .map_err(|e| PacketError::Malformed(e.to_string()))?;
        out.extend_from_slice(&self.payload);

        Ok(out)
    }
}

// ============================================================================
// Test Support
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::test_support::build_segment;
    use super::*;
    use std::net::SocketAddrV4;

    fn host() -> SocketAddrV4 {
        "10.0.0.2:40000".parse().unwrap()
    }

    fn remote() -> SocketAddrV4 {
        "192.168.1.100:443".parse().unwrap()
    }

    #[test]
    fn test_parse_fields() {
        let flags = TcpFlags {
            psh: true,
            ..Default::default()
        };
        let raw = build_segment(host(), remote(), 1001, Some(5001), flags, b"hello");
        let seg = TcpSegment::parse(&raw).unwrap();

        assert_eq!(seg.src_addr(), *host().ip());
        assert_eq!(seg.dst_port(), 443);
        assert_eq!(seg.seq(), 1001);
        assert_eq!(seg.ack(), 5001);
        assert!(seg.flags().ack);
        assert!(seg.flags().psh);
        assert_eq!(seg.payload(), b"hello");
        assert_eq!(usize::from(seg.ip_total_len()), raw.len());
    }

    #[test]
    fn test_rewrite_updates_lengths_and_checksums() {
        let raw = build_segment(host(), remote(), 1001, Some(5001), TcpFlags::default(), b"hello");
        let mut seg = TcpSegment::parse(&raw).unwrap();

        seg.set_seq(9000);
        seg.set_payload(b"hello, longer payload".to_vec());
        let out = seg.to_bytes().unwrap();

        assert_eq!(out.len(), raw.len() + 16);
        let reparsed = TcpSegment::parse(&out).unwrap();
        assert_eq!(reparsed.seq(), 9000);
        assert_eq!(usize::from(reparsed.ip_total_len()), out.len());

        // IPv4 header checksum over the header including the checksum is zero
        let (ip, _) = Ipv4Header::from_slice(&out).unwrap();
        assert_eq!(ip.header_checksum, ip.calc_header_checksum());
    }

    #[test]
    fn test_parse_rejects_short_and_non_tcp() {
        assert_eq!(TcpSegment::parse(&[0x45; 10]).unwrap_err(), PacketError::Truncated(10));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        assert_eq!(TcpSegment::parse(&v6).unwrap_err(), PacketError::NotIpv4(6));

        let mut udp = Vec::new();
        etherparse::PacketBuilder::ipv4([10, 0, 0, 2], [10, 0, 0, 3], 64)
            .udp(53, 53)
            .write(&mut udp, b"x")
            .unwrap();
        assert_eq!(TcpSegment::parse(&udp).unwrap_err(), PacketError::NotTcp(17));
    }

    #[test]
    fn test_parse_ignores_trailing_padding() {
        let mut raw = build_segment(host(), remote(), 1, None, TcpFlags::default(), b"abc");
        raw.extend_from_slice(&[0u8; 6]);

        let seg = TcpSegment::parse(&raw).unwrap();
        assert_eq!(seg.payload(), b"abc");
    }

    #[test]
    fn test_flag_display_and_flaginc() {
        let flags = TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        };
        assert_eq!(flags.to_string(), "SYN ACK");
        assert_eq!(flags.flaginc(), 1);
        assert_eq!(TcpFlags::default().flaginc(), 0);
        assert_eq!(TcpFlags::default().to_string(), "-");
    }
}
