//! Probe packet assembly
//!
//! Pure functions: building a packet for the same inputs yields byte-identical
//! output. ICMP echo headers are assembled with pnet; for IPv4 the echo
//! checksum is filled in here, for IPv6 the kernel computes it over the
//! pseudo-header when the datagram leaves an `IPPROTO_ICMPV6` socket.

use crate::probe::ProbeKind;
use pnet::packet::icmp::{echo_request::MutableEchoRequestPacket, IcmpTypes};
use pnet::packet::icmpv6::{echo_request::MutableEchoRequestPacket as MutableEchoRequestV6Packet, Icmpv6Types};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::checksum as pnet_checksum;
use std::net::IpAddr;

/// ICMP echo header size, identical for v4 and v6 echo requests.
pub const ICMP_HEADER_SIZE: usize = 8;

/// Tile `pattern` across `buf` in `pattern`-sized chunks, truncating the
/// final chunk. An empty pattern leaves the buffer untouched (zero fill).
pub(crate) fn fill_pattern(buf: &mut [u8], pattern: &[u8]) {
    if pattern.is_empty() {
        return;
    }
    let mut offset = 0;
    while offset < buf.len() {
        let chunk = pattern.len().min(buf.len() - offset);
        buf[offset..offset + chunk].copy_from_slice(&pattern[..chunk]);
        offset += chunk;
    }
}

/// Build the full outgoing probe packet.
///
/// For ICMP probes the first 8 bytes are the echo-request header carrying
/// `(ident, sequence)` and sizes below the header size are expanded to it;
/// the remainder is pattern-tiled. UDP probes are pattern-tiled end to end.
pub fn build_probe_packet(
    kind: ProbeKind,
    remote: IpAddr,
    ident: u16,
    sequence: u16,
    size: usize,
    pattern: &[u8],
) -> Vec<u8> {
    let packet_size = match kind {
        ProbeKind::Icmp => size.max(ICMP_HEADER_SIZE),
        ProbeKind::Udp => size,
    };
    let mut buf = vec![0u8; packet_size];
    match kind {
        ProbeKind::Udp => fill_pattern(&mut buf, pattern),
        ProbeKind::Icmp => match remote {
            IpAddr::V4(_) => {
                if let Some(mut echo) = MutableEchoRequestPacket::new(&mut buf) {
                    echo.set_icmp_type(IcmpTypes::EchoRequest);
                    echo.set_identifier(ident);
                    echo.set_sequence_number(sequence);
                    fill_pattern(echo.payload_mut(), pattern);
                    let sum = pnet_checksum(echo.to_immutable().packet(), 1);
                    echo.set_checksum(sum);
                }
            }
            IpAddr::V6(_) => {
                if let Some(mut echo) = MutableEchoRequestV6Packet::new(&mut buf) {
                    echo.set_icmpv6_type(Icmpv6Types::EchoRequest);
                    echo.set_identifier(ident);
                    echo.set_sequence_number(sequence);
                    fill_pattern(echo.payload_mut(), pattern);
                }
            }
        },
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    const V4: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const V6: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

    #[test]
    fn test_icmp_v4_header_fields() {
        let packet = build_probe_packet(ProbeKind::Icmp, V4, 0xabcd, 0x0102, 16, &[]);
        assert_eq!(packet.len(), 16);
        // type 8, code 0
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        // identifier and sequence in network byte order
        assert_eq!(&packet[4..6], &[0xab, 0xcd]);
        assert_eq!(&packet[6..8], &[0x01, 0x02]);
        // checksum is filled in
        assert_ne!(&packet[2..4], &[0, 0]);
    }

    #[test]
    fn test_icmp_v6_header_fields() {
        let packet = build_probe_packet(ProbeKind::Icmp, V6, 0x1234, 9, 16, &[]);
        // type 128, code 0, checksum left for the kernel
        assert_eq!(packet[0], 128);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[2..4], &[0, 0]);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0, 9]);
    }

    #[test]
    fn test_icmp_size_clamped_to_header() {
        let packet = build_probe_packet(ProbeKind::Icmp, V4, 1, 1, 3, &[0xff]);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE);
        // nothing past the header, so the pattern never lands
        assert_eq!(packet[0], 8);
    }

    #[test]
    fn test_udp_not_clamped() {
        let packet = build_probe_packet(ProbeKind::Udp, V4, 1, 1, 3, &[]);
        assert_eq!(packet.len(), 3);
    }

    #[test]
    fn test_pattern_tiling_after_header() {
        let packet = build_probe_packet(ProbeKind::Icmp, V4, 1, 1, 13, b"ab");
        assert_eq!(&packet[8..], b"ababa");
    }

    #[test]
    fn test_udp_pattern_tiles_whole_payload() {
        let packet = build_probe_packet(ProbeKind::Udp, V4, 1, 1, 7, b"xyz");
        assert_eq!(&packet[..], b"xyzxyzx");
    }

    #[test]
    fn test_empty_pattern_zero_fills() {
        let packet = build_probe_packet(ProbeKind::Udp, V4, 1, 1, 5, &[]);
        assert_eq!(packet, vec![0u8; 5]);
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build_probe_packet(ProbeKind::Icmp, V4, 0x42, 7, 64, b"probe");
        let b = build_probe_packet(ProbeKind::Icmp, V4, 0x42, 7, 64, b"probe");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fill_pattern_exact_multiple() {
        let mut buf = [0u8; 6];
        fill_pattern(&mut buf, b"ab");
        assert_eq!(&buf, b"ababab");
    }
}
