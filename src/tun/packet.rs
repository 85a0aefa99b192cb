//! Raw IP packet inspection and construction.
//!
//! The dispatch path peeks at every packet before it reaches the network
//! stack: flow identification needs the 5-tuple, TCP accept needs the SYN
//! flag, and the mapped-DNS responder answers queries by building complete
//! reply packets without involving the stack at all.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::common::{Error, Result};

#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub version: u8,
    pub protocol: IpProtocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Offset of the transport header within the packet.
    pub payload_offset: usize,
    pub total_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl IpProtocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            1 | 58 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

pub fn parse_ip_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(Error::Protocol("empty packet".into()));
    }
    match data[0] >> 4 {
        4 => parse_ipv4_packet(data),
        6 => parse_ipv6_packet(data),
        version => Err(Error::Protocol(format!(
            "unsupported ip version: {}",
            version
        ))),
    }
}

fn parse_ipv4_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.len() < 20 {
        return Err(Error::Protocol("packet too short for ipv4 header".into()));
    }
    let ihl = ((data[0] & 0x0f) as usize) * 4;
    if ihl < 20 || data.len() < ihl {
        return Err(Error::Protocol("invalid ipv4 header length".into()));
    }

    let protocol = IpProtocol::from_number(data[9]);
    let src_ip = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
    let dst_ip = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));

    let (src_port, dst_port) = transport_ports(protocol, data, ihl);

    Ok(ParsedPacket {
        version: 4,
        protocol,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        payload_offset: ihl,
        total_len: data.len(),
    })
}

fn parse_ipv6_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.len() < 40 {
        return Err(Error::Protocol("packet too short for ipv6 header".into()));
    }

    let protocol = IpProtocol::from_number(data[6]);

    let mut src_octets = [0u8; 16];
    src_octets.copy_from_slice(&data[8..24]);
    let mut dst_octets = [0u8; 16];
    dst_octets.copy_from_slice(&data[24..40]);

    // Extension headers are not chased; flows behind them are dropped
    // upstream the same way unsupported protocols are.
    let (src_port, dst_port) = transport_ports(protocol, data, 40);

    Ok(ParsedPacket {
        version: 6,
        protocol,
        src_ip: IpAddr::V6(Ipv6Addr::from(src_octets)),
        dst_ip: IpAddr::V6(Ipv6Addr::from(dst_octets)),
        src_port,
        dst_port,
        payload_offset: 40,
        total_len: data.len(),
    })
}

fn transport_ports(protocol: IpProtocol, data: &[u8], offset: usize) -> (u16, u16) {
    match protocol {
        IpProtocol::Tcp | IpProtocol::Udp if data.len() >= offset + 4 => (
            u16::from_be_bytes([data[offset], data[offset + 1]]),
            u16::from_be_bytes([data[offset + 2], data[offset + 3]]),
        ),
        _ => (0, 0),
    }
}

/// TCP flag byte of a parsed TCP packet, or None when truncated.
pub fn tcp_flags(parsed: &ParsedPacket, data: &[u8]) -> Option<u8> {
    if parsed.protocol != IpProtocol::Tcp {
        return None;
    }
    data.get(parsed.payload_offset + 13).copied()
}

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_ACK: u8 = 0x10;

/// UDP payload of a parsed UDP packet, past the 8-byte UDP header.
pub fn udp_payload<'a>(parsed: &ParsedPacket, data: &'a [u8]) -> Option<&'a [u8]> {
    if parsed.protocol != IpProtocol::Udp {
        return None;
    }
    data.get(parsed.payload_offset + 8..)
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for i in (0..header.len()).step_by(2) {
        let word = if i + 1 < header.len() {
            u16::from_be_bytes([header[i], header[i + 1]])
        } else {
            u16::from_be_bytes([header[i], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build a complete IPv4 UDP packet (20 + 8 + payload). The UDP checksum is
/// left zero, which IPv4 permits.
pub fn build_ipv4_udp_packet(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut pkt = vec![0u8; total_len];

    pkt[0] = 0x45; // version=4, IHL=5
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // Don't Fragment
    pkt[8] = 64; // TTL
    pkt[9] = 17; // UDP
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    let checksum = ipv4_checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&checksum.to_be_bytes());

    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt[28..].copy_from_slice(payload);

    pkt
}

/// Build a complete IPv6 UDP packet (40 + 8 + payload) with the mandatory
/// UDP checksum over the pseudo-header.
pub fn build_ipv6_udp_packet(
    src_ip: Ipv6Addr,
    dst_ip: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 40 + udp_len;
    let mut pkt = vec![0u8; total_len];

    pkt[0] = 0x60; // version=6
    pkt[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt[6] = 17; // UDP
    pkt[7] = 64; // hop limit
    pkt[8..24].copy_from_slice(&src_ip.octets());
    pkt[24..40].copy_from_slice(&dst_ip.octets());

    pkt[40..42].copy_from_slice(&src_port.to_be_bytes());
    pkt[42..44].copy_from_slice(&dst_port.to_be_bytes());
    pkt[44..46].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt[48..].copy_from_slice(payload);

    let csum = udp_checksum_ipv6(src_ip, dst_ip, &pkt[40..]);
    pkt[46..48].copy_from_slice(&csum.to_be_bytes());

    pkt
}

fn udp_checksum_ipv6(src: Ipv6Addr, dst: Ipv6Addr, udp_segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in src.octets().chunks(2).chain(dst.octets().chunks(2)) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    sum += udp_segment.len() as u32;
    sum += 17u32;

    let mut i = 0;
    while i + 1 < udp_segment.len() {
        sum += u16::from_be_bytes([udp_segment[i], udp_segment[i + 1]]) as u32;
        i += 2;
    }
    if i < udp_segment.len() {
        sum += (udp_segment[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    let csum = !(sum as u16);
    if csum == 0 {
        0xFFFF
    } else {
        csum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ipv4_tcp(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, flags: u8) -> Vec<u8> {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x45;
        pkt[9] = 6;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
        pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
        pkt[32] = 5 << 4;
        pkt[33] = flags;
        pkt
    }

    #[test]
    fn parse_ipv4_tcp() {
        let pkt = build_ipv4_tcp([10, 0, 0, 2], [1, 1, 1, 1], 50000, 443, TCP_FLAG_SYN);
        let parsed = parse_ip_packet(&pkt).unwrap();
        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.protocol, IpProtocol::Tcp);
        assert_eq!(parsed.src_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.dst_ip, "1.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.src_port, 50000);
        assert_eq!(parsed.dst_port, 443);
        assert_eq!(tcp_flags(&parsed, &pkt), Some(TCP_FLAG_SYN));
    }

    #[test]
    fn parse_ipv6_udp() {
        let pkt = build_ipv6_udp_packet(
            "2001:db8::1".parse().unwrap(),
            "2001:4860:4860::8888".parse().unwrap(),
            53000,
            53,
            b"query",
        );
        let parsed = parse_ip_packet(&pkt).unwrap();
        assert_eq!(parsed.version, 6);
        assert_eq!(parsed.protocol, IpProtocol::Udp);
        assert_eq!(parsed.src_port, 53000);
        assert_eq!(parsed.dst_port, 53);
        assert_eq!(udp_payload(&parsed, &pkt), Some(&b"query"[..]));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_ip_packet(&[]).is_err());
        assert!(parse_ip_packet(&[0x45, 0, 0]).is_err());
        assert!(parse_ip_packet(&[0x30; 40]).is_err());
    }

    #[test]
    fn ipv4_udp_packet_layout() {
        let pkt = build_ipv4_udp_packet(
            "8.8.8.8".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            53,
            53000,
            b"reply",
        );
        assert_eq!(pkt[0] >> 4, 4);
        assert_eq!(pkt[9], 17);
        let parsed = parse_ip_packet(&pkt).unwrap();
        assert_eq!(parsed.src_port, 53);
        assert_eq!(parsed.dst_port, 53000);
        assert_eq!(udp_payload(&parsed, &pkt), Some(&b"reply"[..]));
        // IP header checksum verifies back to zero
        let mut sum: u32 = 0;
        for i in (0..20).step_by(2) {
            sum += u16::from_be_bytes([pkt[i], pkt[i + 1]]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xFFFF);
    }

    #[test]
    fn protocol_numbers() {
        assert_eq!(IpProtocol::from_number(6), IpProtocol::Tcp);
        assert_eq!(IpProtocol::from_number(17), IpProtocol::Udp);
        assert_eq!(IpProtocol::from_number(1), IpProtocol::Icmp);
        assert_eq!(IpProtocol::from_number(58), IpProtocol::Icmp);
        assert_eq!(IpProtocol::from_number(89), IpProtocol::Other(89));
    }
}
