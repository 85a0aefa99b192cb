use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use bytes::{BufMut, BytesMut};

use crate::common::{Error, Result};

/// Relay destination address. A `Domain` is produced when the destination IP
/// falls inside the mapped-DNS subnet and a hostname is on record, so the
/// proxy sees the original name instead of the synthesized address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 编码为 SOCKS5 地址格式
    /// [ATYP: 1B] [ADDR: 变长] [PORT: 2B]
    /// ATYP: 0x01=IPv4, 0x03=Domain, 0x04=IPv6
    pub fn encode_socks5(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(0x04);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Domain(domain, _) => {
                buf.put_u8(0x03);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(self.port());
    }

    /// 从 SOCKS5 UDP 封装头解析地址，返回 (地址, 消耗的字节数)
    pub fn parse_socks5_udp_addr(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(Error::Protocol("socks5 udp address truncated".into()));
        }
        match data[0] {
            0x01 => {
                if data.len() < 1 + 4 + 2 {
                    return Err(Error::Protocol("socks5 udp ipv4 address truncated".into()));
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            0x03 => {
                let len = data[1] as usize;
                if data.len() < 2 + len + 2 {
                    return Err(Error::Protocol("socks5 udp domain truncated".into()));
                }
                let domain = String::from_utf8(data[2..2 + len].to_vec())
                    .map_err(|_| Error::Protocol("socks5 udp domain is not utf-8".into()))?;
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((Address::Domain(domain, port), 2 + len + 2))
            }
            0x04 => {
                if data.len() < 1 + 16 + 2 {
                    return Err(Error::Protocol("socks5 udp ipv6 address truncated".into()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            atyp => Err(Error::Protocol(format!(
                "unsupported SOCKS5 address type: 0x{:02x}",
                atyp
            ))),
        }
    }

    /// 解析为 SocketAddr（域名走系统解析器）
    pub fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => format!("{}:{}", domain, port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    Error::Protocol(format!("DNS resolution failed for {}:{}", domain, port))
                }),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
