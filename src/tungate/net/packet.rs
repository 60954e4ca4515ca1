//! IPv4/TCP/UDP parsing and synthesis. Parsing borrows from the caller-owned buffer; building
//! always produces a fresh standalone frame (this gateway never forwards IP payloads verbatim
//! start to finish — every outbound frame is synthesized from flow-engine state).

use std::net::Ipv4Addr;

use super::checksum::{internet_checksum, internet_checksum_with_seed, pseudo_header_sum};

pub const TCP_MSS_DEFAULT: u16 = 1460;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    fn from_byte(b: u8) -> Self {
        match b {
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Other(b) => b,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("not IPv4 (version {0})")]
    NotIpv4(u8),
    #[error("IHL {0} implies a header longer than the frame")]
    HeaderTooLong(u8),
    #[error("total length {total} exceeds frame length {frame}")]
    TotalLengthMismatch { total: u16, frame: usize },
    #[error("IPv4 header checksum mismatch")]
    BadIpChecksum,
    #[error("TCP/UDP header truncated")]
    TransportTruncated,
    #[error("TCP data offset {0} implies a header longer than the segment")]
    TcpHeaderTooLong(u8),
    #[error("transport checksum mismatch")]
    BadTransportChecksum,
}

/// A parsed IPv4 datagram. Holds the protocol's header fields plus a view into the original
/// buffer for the L4 segment; callers reparse that slice as TCP or UDP based on `protocol`.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: IpProtocol,
    pub ttl: u8,
    pub segment: &'a [u8],
}

/// Parses an IPv4 header and returns the protocol payload (TCP/UDP segment) unparsed.
/// Verifies the IPv4 header checksum; does not verify the L4 checksum (callers that care, such
/// as the TCP/UDP parsers below, do that themselves since it needs the pseudo-header).
pub fn parse_ipv4(frame: &[u8]) -> Result<Ipv4Packet<'_>, ParseError> {
    if frame.len() < 20 {
        return Err(ParseError::TooShort(frame.len()));
    }
    let version = frame[0] >> 4;
    if version != 4 {
        return Err(ParseError::NotIpv4(version));
    }
    let ihl = frame[0] & 0x0f;
    let header_len = ihl as usize * 4;
    if header_len < 20 || header_len > frame.len() {
        return Err(ParseError::HeaderTooLong(ihl));
    }

    let total_length = u16::from_be_bytes([frame[2], frame[3]]);
    if total_length as usize > frame.len() {
        return Err(ParseError::TotalLengthMismatch {
            total: total_length,
            frame: frame.len(),
        });
    }

    if internet_checksum(&frame[..header_len]) != 0 {
        return Err(ParseError::BadIpChecksum);
    }

    let protocol = IpProtocol::from_byte(frame[9]);
    let ttl = frame[8];
    let src = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);

    let end = total_length as usize;
    let segment = &frame[header_len..end];

    Ok(Ipv4Packet {
        src,
        dst,
        protocol,
        ttl,
        segment,
    })
}

pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

pub fn parse_tcp<'a>(
    ip: &Ipv4Packet<'a>,
) -> Result<TcpSegment<'a>, ParseError> {
    let seg = ip.segment;
    if seg.len() < 20 {
        return Err(ParseError::TransportTruncated);
    }
    let data_offset = seg[12] >> 4;
    let header_len = data_offset as usize * 4;
    if header_len < 20 || header_len > seg.len() {
        return Err(ParseError::TcpHeaderTooLong(data_offset));
    }

    let src_port = u16::from_be_bytes([seg[0], seg[1]]);
    let dst_port = u16::from_be_bytes([seg[2], seg[3]]);
    let seq = u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]);
    let ack = u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]);
    let flags = seg[13];
    let window = u16::from_be_bytes([seg[14], seg[15]]);

    let seed = pseudo_header_sum(ip.src.octets(), ip.dst.octets(), 6, seg.len() as u16);
    if internet_checksum_with_seed(seed, seg) != 0 {
        return Err(ParseError::BadTransportChecksum);
    }

    Ok(TcpSegment {
        src_port,
        dst_port,
        seq,
        ack,
        flags,
        window,
        payload: &seg[header_len..],
    })
}

#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

pub fn parse_udp<'a>(ip: &Ipv4Packet<'a>) -> Result<UdpDatagram<'a>, ParseError> {
    let seg = ip.segment;
    if seg.len() < 8 {
        return Err(ParseError::TransportTruncated);
    }
    let src_port = u16::from_be_bytes([seg[0], seg[1]]);
    let dst_port = u16::from_be_bytes([seg[2], seg[3]]);
    let length = u16::from_be_bytes([seg[4], seg[5]]) as usize;
    if length > seg.len() || length < 8 {
        return Err(ParseError::TransportTruncated);
    }

    let checksum = u16::from_be_bytes([seg[6], seg[7]]);
    if checksum != 0 {
        let seed = pseudo_header_sum(ip.src.octets(), ip.dst.octets(), 17, length as u16);
        if internet_checksum_with_seed(seed, &seg[..length]) != 0 {
            return Err(ParseError::BadTransportChecksum);
        }
    }

    Ok(UdpDatagram {
        src_port,
        dst_port,
        payload: &seg[8..length],
    })
}

/// Builds a full IPv4 frame wrapping `segment` (an already-built TCP or UDP segment, checksum
/// included) with the given protocol, identification, and TTL.
pub fn build_ipv4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpProtocol,
    identification: u16,
    ttl: u8,
    segment: &[u8],
) -> Vec<u8> {
    let total_length = 20 + segment.len();
    let mut out = Vec::with_capacity(total_length);
    out.push(0x45); // version 4, IHL 5
    out.push(0x00); // DSCP/ECN
    out.extend_from_slice(&(total_length as u16).to_be_bytes());
    out.extend_from_slice(&identification.to_be_bytes());
    out.extend_from_slice(&0x4000u16.to_be_bytes()); // DF set, no fragmentation
    out.push(ttl);
    out.push(protocol.as_byte());
    out.extend_from_slice(&[0, 0]); // checksum placeholder
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&dst.octets());

    let csum = internet_checksum(&out[..20]);
    out[10..12].copy_from_slice(&csum.to_be_bytes());

    out.extend_from_slice(segment);
    out
}

/// Builds a TCP segment (header + optional MSS option + payload) with a valid checksum computed
/// against the given IPv4 endpoints.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_segment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    payload: &[u8],
) -> Vec<u8> {
    let options_len = if mss.is_some() { 4 } else { 0 };
    let header_len = 20 + options_len;
    let data_offset = (header_len / 4) as u8;

    let mut seg = Vec::with_capacity(header_len + payload.len());
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push(data_offset << 4);
    seg.push(flags);
    seg.extend_from_slice(&window.to_be_bytes());
    seg.extend_from_slice(&[0, 0]); // checksum placeholder
    seg.extend_from_slice(&[0, 0]); // urgent pointer

    if let Some(mss) = mss {
        seg.push(0x02); // kind: MSS
        seg.push(0x04); // length: 4
        seg.extend_from_slice(&mss.to_be_bytes());
    }

    seg.extend_from_slice(payload);

    let seed = pseudo_header_sum(src.octets(), dst.octets(), 6, seg.len() as u16);
    let csum = internet_checksum_with_seed(seed, &seg);
    seg[16..18].copy_from_slice(&csum.to_be_bytes());

    seg
}

pub fn build_udp_datagram(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let length = 8 + payload.len();
    let mut seg = Vec::with_capacity(length);
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&(length as u16).to_be_bytes());
    seg.extend_from_slice(&[0, 0]); // checksum placeholder
    seg.extend_from_slice(payload);

    let seed = pseudo_header_sum(src.octets(), dst.octets(), 17, length as u16);
    let csum = internet_checksum_with_seed(seed, &seg);
    // RFC 768: a computed checksum of exactly zero is transmitted as all-ones.
    let csum = if csum == 0 { 0xffff } else { csum };
    seg[6..8].copy_from_slice(&csum.to_be_bytes());

    seg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (Ipv4Addr, Ipv4Addr) {
        (Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(93, 184, 216, 34))
    }

    #[test]
    fn tcp_round_trips_through_ipv4_build_and_parse() {
        let (src, dst) = addrs();
        let tcp = build_tcp_segment(
            src,
            dst,
            5555,
            80,
            1000,
            0,
            tcp_flags::SYN,
            65535,
            Some(TCP_MSS_DEFAULT),
            &[],
        );
        let frame = build_ipv4(src, dst, IpProtocol::Tcp, 1, 64, &tcp);

        let ip = parse_ipv4(&frame).expect("parse ip");
        assert_eq!(ip.src, src);
        assert_eq!(ip.dst, dst);
        assert!(matches!(ip.protocol, IpProtocol::Tcp));

        let parsed = parse_tcp(&ip).expect("parse tcp");
        assert_eq!(parsed.src_port, 5555);
        assert_eq!(parsed.dst_port, 80);
        assert_eq!(parsed.seq, 1000);
        assert!(parsed.has_flag(tcp_flags::SYN));
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn udp_round_trips_with_payload() {
        let (src, dst) = addrs();
        let udp = build_udp_datagram(src, dst, 53000, 53, b"hello");
        let frame = build_ipv4(src, dst, IpProtocol::Udp, 2, 64, &udp);

        let ip = parse_ipv4(&frame).expect("parse ip");
        let parsed = parse_udp(&ip).expect("parse udp");
        assert_eq!(parsed.src_port, 53000);
        assert_eq!(parsed.dst_port, 53);
        assert_eq!(parsed.payload, b"hello");
    }

    #[test]
    fn corrupted_ip_checksum_is_rejected() {
        let (src, dst) = addrs();
        let udp = build_udp_datagram(src, dst, 1, 2, b"x");
        let mut frame = build_ipv4(src, dst, IpProtocol::Udp, 3, 64, &udp);
        frame[11] ^= 0xff;
        assert_eq!(parse_ipv4(&frame), Err(ParseError::BadIpChecksum));
    }

    #[test]
    fn corrupted_tcp_checksum_is_rejected() {
        let (src, dst) = addrs();
        let mut tcp = build_tcp_segment(src, dst, 1, 2, 0, 0, tcp_flags::ACK, 1024, None, b"x");
        tcp[tcp.len() - 1] ^= 0xff;
        let frame = build_ipv4(src, dst, IpProtocol::Tcp, 4, 64, &tcp);
        let ip = parse_ipv4(&frame).expect("parse ip");
        assert_eq!(parse_tcp(&ip), Err(ParseError::BadTransportChecksum));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert_eq!(parse_ipv4(&[0x45, 0x00]), Err(ParseError::TooShort(2)));
    }

    #[test]
    fn udp_zero_checksum_is_accepted_unverified() {
        let (src, dst) = addrs();
        let mut udp = build_udp_datagram(src, dst, 1, 2, b"hi");
        udp[6] = 0;
        udp[7] = 0;
        let frame = build_ipv4(src, dst, IpProtocol::Udp, 5, 64, &udp);
        let ip = parse_ipv4(&frame).expect("parse ip");
        let parsed = parse_udp(&ip).expect("parse udp with zero checksum");
        assert_eq!(parsed.payload, b"hi");
    }
}
