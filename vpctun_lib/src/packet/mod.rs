//! Zero-allocation IPv4/TCP/UDP header handling for the translation engine.
//!
//! Parsing borrows from the datagram; emission builds synthetic segments
//! toward the application with fixed TTL, don't-fragment, and a static
//! 65535 receive window.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Largest payload carried by one synthesized segment.
pub const MAX_SEGMENT_PAYLOAD: usize = 16384;

const SYNTH_TTL: u8 = 64;
const SYNTH_WINDOW: u16 = 65535;
const IP_FLAG_DF: u16 = 0x4000;
const IP_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub l4: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Parses an IPv4 datagram, returning `None` for anything that must be
/// dropped: wrong version, bad header length, or a total-length field that
/// disagrees with the datagram.
pub fn parse_ipv4(datagram: &[u8]) -> Option<Ipv4Packet<'_>> {
    if datagram.len() < IP_HEADER_LEN || datagram[0] >> 4 != 4 {
        return None;
    }
    let header_len = ((datagram[0] & 0x0f) as usize) * 4;
    if !(IP_HEADER_LEN..=60).contains(&header_len) || header_len > datagram.len() {
        return None;
    }
    let total_len = be16(datagram, 2) as usize;
    if total_len != datagram.len() || total_len < header_len {
        return None;
    }
    Some(Ipv4Packet {
        src: Ipv4Addr::from(be32(datagram, 12)),
        dst: Ipv4Addr::from(be32(datagram, 16)),
        protocol: datagram[9],
        l4: &datagram[header_len..],
    })
}

/// Parses the TCP portion of a datagram's L4 slice, validating the data
/// offset against the slice.
pub fn parse_tcp(l4: &[u8]) -> Option<TcpSegment<'_>> {
    if l4.len() < TCP_HEADER_LEN {
        return None;
    }
    let data_offset = ((l4[12] >> 4) as usize) * 4;
    if !(TCP_HEADER_LEN..=60).contains(&data_offset) || data_offset > l4.len() {
        return None;
    }
    Some(TcpSegment {
        src_port: be16(l4, 0),
        dst_port: be16(l4, 2),
        seq: be32(l4, 4),
        ack: be32(l4, 8),
        flags: l4[13],
        payload: &l4[data_offset..],
    })
}

/// Parses the UDP portion of a datagram's L4 slice, validating the length
/// field against the slice.
pub fn parse_udp(l4: &[u8]) -> Option<UdpDatagram<'_>> {
    if l4.len() < UDP_HEADER_LEN {
        return None;
    }
    let length = be16(l4, 4) as usize;
    if length < UDP_HEADER_LEN || length > l4.len() {
        return None;
    }
    Some(UdpDatagram {
        src_port: be16(l4, 0),
        dst_port: be16(l4, 2),
        payload: &l4[UDP_HEADER_LEN..length],
    })
}

/// Builds a synthetic IPv4+TCP datagram with valid header and pseudo-header
/// checksums. `payload` must not exceed [`MAX_SEGMENT_PAYLOAD`].
pub fn build_tcp(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_SEGMENT_PAYLOAD);
    let total_len = IP_HEADER_LEN + TCP_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(total_len);

    put_ip_header(&mut buf, src, dst, PROTO_TCP, total_len);

    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.put_u32(seq);
    buf.put_u32(ack);
    buf.put_u8((TCP_HEADER_LEN as u8 / 4) << 4);
    buf.put_u8(flags);
    buf.put_u16(SYNTH_WINDOW);
    buf.put_u16(0); // checksum, filled below
    buf.put_u16(0); // urgent pointer
    buf.put_slice(payload);

    let mut packet = buf.to_vec();
    finish_checksums(&mut packet, src, dst, PROTO_TCP, IP_HEADER_LEN + 16);
    packet
}

/// Builds a synthetic IPv4+UDP datagram with valid checksums.
pub fn build_udp(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IP_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(total_len);

    put_ip_header(&mut buf, src, dst, PROTO_UDP, total_len);

    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.put_u16((UDP_HEADER_LEN + payload.len()) as u16);
    buf.put_u16(0); // checksum, filled below
    buf.put_slice(payload);

    let mut packet = buf.to_vec();
    finish_checksums(&mut packet, src, dst, PROTO_UDP, IP_HEADER_LEN + 6);
    packet
}

fn put_ip_header(buf: &mut BytesMut, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, total_len: usize) {
    buf.put_u8(0x45); // version 4, ihl 5
    buf.put_u8(0); // dscp/ecn
    buf.put_u16(total_len as u16);
    buf.put_u16(0); // identification
    buf.put_u16(IP_FLAG_DF);
    buf.put_u8(SYNTH_TTL);
    buf.put_u8(protocol);
    buf.put_u16(0); // header checksum, filled below
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());
}

fn finish_checksums(
    packet: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    l4_checksum_at: usize,
) {
    let ip_sum = internet_checksum(&[&packet[..IP_HEADER_LEN]]);
    packet[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    let l4_sum = l4_checksum(src, dst, protocol, &packet[IP_HEADER_LEN..]);
    packet[l4_checksum_at..l4_checksum_at + 2].copy_from_slice(&l4_sum.to_be_bytes());
}

/// One's-complement sum over the concatenation of `parts`, with the usual
/// trailing-odd-byte handling.
fn internet_checksum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    for part in parts {
        let mut chunks = part.chunks_exact(2);
        for pair in &mut chunks {
            sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [odd] = chunks.remainder() {
            sum += u32::from(*odd) << 8;
        }
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum over the standard IPv4 pseudo-header plus the L4 segment.
fn l4_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    internet_checksum(&[&pseudo, segment])
}

/// Validates the IP header checksum of a parsed datagram.
pub fn ipv4_checksum_valid(datagram: &[u8]) -> bool {
    if datagram.len() < IP_HEADER_LEN {
        return false;
    }
    let header_len = ((datagram[0] & 0x0f) as usize) * 4;
    if header_len > datagram.len() {
        return false;
    }
    internet_checksum(&[&datagram[..header_len]]) == 0
}

/// Validates the TCP or UDP checksum, pseudo-header included.
pub fn l4_checksum_valid(datagram: &[u8]) -> bool {
    let Some(packet) = parse_ipv4(datagram) else {
        return false;
    };
    l4_checksum(packet.src, packet.dst, packet.protocol, packet.l4) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 10);

    #[test]
    fn tcp_round_trip() {
        let payload = b"GET / HTTP/1.1\r\n\r\n";
        let datagram = build_tcp(
            SRC,
            40000,
            DST,
            80,
            12345,
            67890,
            tcp_flags::PSH | tcp_flags::ACK,
            payload,
        );

        let packet = parse_ipv4(&datagram).expect("ip parse");
        assert_eq!(packet.src, SRC);
        assert_eq!(packet.dst, DST);
        assert_eq!(packet.protocol, PROTO_TCP);

        let segment = parse_tcp(packet.l4).expect("tcp parse");
        assert_eq!(segment.src_port, 40000);
        assert_eq!(segment.dst_port, 80);
        assert_eq!(segment.seq, 12345);
        assert_eq!(segment.ack, 67890);
        assert!(segment.has(tcp_flags::PSH));
        assert!(segment.has(tcp_flags::ACK));
        assert!(!segment.has(tcp_flags::SYN));
        assert_eq!(segment.payload, payload);
    }

    #[test]
    fn udp_round_trip() {
        let payload = vec![0xabu8; 512];
        let datagram = build_udp(DST, 53, SRC, 40001, &payload);

        let packet = parse_ipv4(&datagram).expect("ip parse");
        assert_eq!(packet.protocol, PROTO_UDP);
        let udp = parse_udp(packet.l4).expect("udp parse");
        assert_eq!(udp.src_port, 53);
        assert_eq!(udp.dst_port, 40001);
        assert_eq!(udp.payload, &payload[..]);
    }

    #[test]
    fn emitted_checksums_validate() {
        let tcp = build_tcp(SRC, 1, DST, 2, 0, 0, tcp_flags::SYN | tcp_flags::ACK, &[]);
        assert!(ipv4_checksum_valid(&tcp));
        assert!(l4_checksum_valid(&tcp));

        let udp = build_udp(SRC, 53, DST, 53, b"response");
        assert!(ipv4_checksum_valid(&udp));
        assert!(l4_checksum_valid(&udp));

        // odd payload length exercises the trailing-byte path
        let odd = build_tcp(SRC, 1, DST, 2, 7, 9, tcp_flags::ACK, b"xyz");
        assert!(l4_checksum_valid(&odd));
    }

    #[test]
    fn max_payload_round_trip() {
        let payload = vec![0x5au8; MAX_SEGMENT_PAYLOAD];
        let datagram = build_tcp(SRC, 1, DST, 2, 1, 1, tcp_flags::PSH | tcp_flags::ACK, &payload);
        let packet = parse_ipv4(&datagram).unwrap();
        let segment = parse_tcp(packet.l4).unwrap();
        assert_eq!(segment.payload.len(), MAX_SEGMENT_PAYLOAD);
        assert!(l4_checksum_valid(&datagram));
    }

    #[test]
    fn corrupted_checksum_detected() {
        let mut datagram = build_tcp(SRC, 1, DST, 2, 1, 1, tcp_flags::ACK, b"data");
        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;
        assert!(!l4_checksum_valid(&datagram));
    }

    #[test]
    fn malformed_ip_dropped() {
        // wrong version
        let mut v6 = build_tcp(SRC, 1, DST, 2, 0, 0, tcp_flags::SYN, &[]);
        v6[0] = 0x65;
        assert!(parse_ipv4(&v6).is_none());

        // ihl below minimum
        let mut short_ihl = build_tcp(SRC, 1, DST, 2, 0, 0, tcp_flags::SYN, &[]);
        short_ihl[0] = 0x44;
        assert!(parse_ipv4(&short_ihl).is_none());

        // total length disagrees with the datagram
        let mut bad_len = build_tcp(SRC, 1, DST, 2, 0, 0, tcp_flags::SYN, &[]);
        bad_len[3] = bad_len[3].wrapping_add(4);
        assert!(parse_ipv4(&bad_len).is_none());

        // truncated header
        assert!(parse_ipv4(&[0x45u8; 12]).is_none());
    }

    #[test]
    fn malformed_tcp_dropped() {
        assert!(parse_tcp(&[0u8; 10]).is_none());

        // data offset beyond the segment
        let mut l4 = [0u8; 20];
        l4[12] = 0xf0;
        assert!(parse_tcp(&l4).is_none());

        // data offset below minimum
        l4[12] = 0x10;
        assert!(parse_tcp(&l4).is_none());
    }

    #[test]
    fn malformed_udp_dropped() {
        assert!(parse_udp(&[0u8; 4]).is_none());

        // length field larger than the slice
        let mut l4 = [0u8; 8];
        l4[5] = 64;
        assert!(parse_udp(&l4).is_none());

        // length field below the header size
        l4[5] = 4;
        assert!(parse_udp(&l4).is_none());
    }
}
