//! SOCKS5 client (RFC 1928 / RFC 1929).
//!
//! Implements the client side used by sessions:
//! - method negotiation (no-auth / username-password)
//! - CONNECT for TCP flows
//! - UDP ASSOCIATE plus datagram encapsulation for UDP flows
//!
//! All I/O is blocking with caller-supplied timeouts; sessions run on
//! dedicated pool workers and never touch the network stack from here.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tracing::debug;

use crate::common::{Address, Error, Result};
use crate::proxy::RelaySettings;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_REJECTED: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Open a TCP connection to the proxy server itself.
fn connect_server(settings: &RelaySettings) -> Result<TcpStream> {
    let mut last_err: Option<std::io::Error> = None;
    let addrs: Vec<SocketAddr> = format!("{}:{}", settings.server, settings.port)
        .to_socket_addrs()?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Protocol(format!(
            "cannot resolve socks5 server {}",
            settings.server
        )));
    }

    for addr in addrs {
        match TcpStream::connect_timeout(&addr, settings.connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(settings.rw_timeout))?;
                stream.set_write_timeout(Some(settings.rw_timeout))?;
                let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
                SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::Io(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "connect failed")
    })))
}

/// Method negotiation plus optional RFC 1929 authentication.
fn handshake(stream: &mut TcpStream, settings: &RelaySettings) -> Result<()> {
    let has_auth = settings.username.is_some() && settings.password.is_some();

    if has_auth {
        stream.write_all(&[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS])?;
    } else {
        stream.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])?;
    }

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp)?;
    if resp[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!(
            "socks5: server returned unsupported version: 0x{:02x}",
            resp[0]
        )));
    }

    match resp[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let username = settings.username.as_deref().unwrap_or_default();
            let password = settings.password.as_deref().unwrap_or_default();

            let mut auth_req = Vec::with_capacity(3 + username.len() + password.len());
            auth_req.push(AUTH_VERSION);
            auth_req.push(username.len() as u8);
            auth_req.extend_from_slice(username.as_bytes());
            auth_req.push(password.len() as u8);
            auth_req.extend_from_slice(password.as_bytes());
            stream.write_all(&auth_req)?;

            let mut auth_resp = [0u8; 2];
            stream.read_exact(&mut auth_resp)?;
            if auth_resp[1] != 0x00 {
                return Err(Error::AuthFailed(format!(
                    "socks5 status 0x{:02x}",
                    auth_resp[1]
                )));
            }
            debug!("socks5: authentication successful");
        }
        METHOD_REJECTED => {
            return Err(Error::AuthFailed(
                "socks5: server rejected all authentication methods".into(),
            ));
        }
        method => {
            return Err(Error::Protocol(format!(
                "socks5: unsupported auth method selected: 0x{:02x}",
                method
            )));
        }
    }

    Ok(())
}

/// Send a request and read the reply; returns the server's bound address.
fn request(stream: &mut TcpStream, cmd: u8, target: &Address) -> Result<Address> {
    let mut req = BytesMut::with_capacity(64);
    req.put_u8(SOCKS_VERSION);
    req.put_u8(cmd);
    req.put_u8(0x00); // RSV
    target.encode_socks5(&mut req);
    stream.write_all(&req)?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head)?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!(
            "socks5: invalid reply version: 0x{:02x}",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        let reason = match head[1] {
            0x01 => "general failure",
            0x02 => "connection not allowed",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unknown error",
        };
        return Err(Error::Protocol(format!(
            "socks5: request failed: {} (0x{:02x})",
            reason, head[1]
        )));
    }

    let mut atyp = [0u8; 1];
    stream.read_exact(&mut atyp)?;
    let bind_addr = match atyp[0] {
        0x01 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf)?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Address::Ip(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain)?;
            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf)?;
            Address::Domain(
                String::from_utf8_lossy(&domain).to_string(),
                u16::from_be_bytes(port_buf),
            )
        }
        0x04 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Address::Ip(SocketAddr::new(IpAddr::V6(octets.into()), port))
        }
        atyp => {
            return Err(Error::Protocol(format!(
                "socks5: unsupported bind address type: 0x{:02x}",
                atyp
            )));
        }
    };

    Ok(bind_addr)
}

/// Establish a CONNECT tunnel to `target` through the proxy.
pub fn connect_tcp(settings: &RelaySettings, target: &Address) -> Result<TcpStream> {
    debug!(target = %target, server = %settings.server, port = settings.port, "socks5 CONNECT");
    let mut stream = connect_server(settings)?;
    handshake(&mut stream, settings)?;
    let _bind = request(&mut stream, CMD_CONNECT, target)?;
    debug!(target = %target, "socks5 CONNECT tunnel established");
    Ok(stream)
}

/// Result of a UDP ASSOCIATE: the relay endpoint plus the control
/// connection that must stay open for the association's lifetime.
pub struct UdpAssociation {
    pub relay_addr: SocketAddr,
    pub control: TcpStream,
}

pub fn udp_associate(settings: &RelaySettings) -> Result<UdpAssociation> {
    debug!(server = %settings.server, port = settings.port, "socks5 UDP ASSOCIATE");
    let mut control = connect_server(settings)?;
    handshake(&mut control, settings)?;

    let placeholder = Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let bind_addr = request(&mut control, CMD_UDP_ASSOCIATE, &placeholder)?;

    let relay_addr = match &bind_addr {
        Address::Ip(addr) => {
            if addr.ip().is_unspecified() {
                // Some servers return 0.0.0.0; fall back to the server host.
                let ip: IpAddr = settings
                    .server
                    .parse()
                    .or_else(|_| control.peer_addr().map(|a| a.ip()))?;
                SocketAddr::new(ip, addr.port())
            } else {
                *addr
            }
        }
        Address::Domain(_, _) => bind_addr.resolve()?,
    };

    debug!(relay = %relay_addr, "socks5 UDP relay address");
    Ok(UdpAssociation {
        relay_addr,
        control,
    })
}

/// Open the TCP stream that carries length-prefixed datagrams in
/// UDP-in-TCP mode. The association request tells the server the stream
/// relays UDP.
pub fn udp_over_tcp(settings: &RelaySettings) -> Result<TcpStream> {
    debug!(server = %settings.server, port = settings.port, "socks5 UDP-in-TCP");
    let mut stream = connect_server(settings)?;
    handshake(&mut stream, settings)?;
    let placeholder = Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let _bind = request(&mut stream, CMD_UDP_ASSOCIATE, &placeholder)?;
    Ok(stream)
}

/// SOCKS5 UDP request header + payload:
/// `[RSV:2][FRAG:1][ATYP][ADDR][PORT][DATA]`
pub fn encode_udp_datagram(target: &Address, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(3 + 32 + payload.len());
    buf.put_slice(&[0x00, 0x00, 0x00]); // RSV + FRAG=0
    target.encode_socks5(&mut buf);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Parse one encapsulated datagram; fragments are not supported and are
/// rejected as a protocol error.
pub fn decode_udp_datagram(data: &[u8]) -> Result<(Address, &[u8])> {
    if data.len() < 4 {
        return Err(Error::Protocol("socks5 udp datagram too short".into()));
    }
    if data[2] != 0 {
        return Err(Error::Protocol("socks5 udp fragments unsupported".into()));
    }
    let (addr, consumed) = Address::parse_socks5_udp_addr(&data[3..])?;
    Ok((addr, &data[3 + consumed..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn settings(port: u16, auth: bool) -> RelaySettings {
        RelaySettings {
            server: "127.0.0.1".to_string(),
            port,
            username: auth.then(|| "admin".to_string()),
            password: auth.then(|| "secret".to_string()),
            udp_mode: crate::config::UdpMode::Udp,
            connect_timeout: Duration::from_secs(2),
            rw_timeout: Duration::from_secs(2),
            udp_idle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn connect_no_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();

            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).unwrap();
            assert_eq!(buf, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).unwrap();

            let mut req = vec![0u8; 256];
            let n = sock.read(&mut req).unwrap();
            assert!(n >= 10);
            assert_eq!(req[0], 0x05);
            assert_eq!(req[1], CMD_CONNECT);
            assert_eq!(req[3], 0x03); // domain
            let len = req[4] as usize;
            assert_eq!(&req[5..5 + len], b"example.com");

            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
                .unwrap();
        });

        let target = Address::Domain("example.com".to_string(), 80);
        let stream = connect_tcp(&settings(port, false), &target).unwrap();
        drop(stream);
        server.join().unwrap();
    }

    #[test]
    fn connect_with_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();

            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).unwrap();
            assert_eq!(buf[0], 0x05);
            assert_eq!(buf[1], 0x02); // two methods offered
            sock.write_all(&[0x05, 0x02]).unwrap();

            let mut auth = vec![0u8; 64];
            let n = sock.read(&mut auth).unwrap();
            assert!(n > 2);
            assert_eq!(auth[0], 0x01);
            let ulen = auth[1] as usize;
            assert_eq!(&auth[2..2 + ulen], b"admin");
            let plen = auth[2 + ulen] as usize;
            assert_eq!(&auth[3 + ulen..3 + ulen + plen], b"secret");
            sock.write_all(&[0x01, 0x00]).unwrap();

            let mut req = vec![0u8; 256];
            let _ = sock.read(&mut req).unwrap();
            assert_eq!(req[1], CMD_CONNECT);
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .unwrap();
        });

        let target = Address::Ip("1.2.3.4:443".parse().unwrap());
        let stream = connect_tcp(&settings(port, true), &target).unwrap();
        drop(stream);
        server.join().unwrap();
    }

    #[test]
    fn connect_reports_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&[0x05, 0x00]).unwrap();
            let mut req = vec![0u8; 256];
            let _ = sock.read(&mut req).unwrap();
            // connection refused
            sock.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .unwrap();
        });

        let target = Address::Ip("1.2.3.4:443".parse().unwrap());
        let err = connect_tcp(&settings(port, false), &target).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        server.join().unwrap();
    }

    #[test]
    fn udp_associate_resolves_unspecified_bind() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&[0x05, 0x00]).unwrap();
            let mut req = vec![0u8; 256];
            let n = sock.read(&mut req).unwrap();
            assert!(n >= 4);
            assert_eq!(req[1], CMD_UDP_ASSOCIATE);
            // bind 0.0.0.0:7777
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x1E, 0x61])
                .unwrap();
            // keep control open until the client is done
            let mut tail = [0u8; 1];
            let _ = sock.read(&mut tail);
        });

        let assoc = udp_associate(&settings(port, false)).unwrap();
        assert_eq!(assoc.relay_addr, "127.0.0.1:7777".parse().unwrap());
        drop(assoc);
        server.join().unwrap();
    }

    #[test]
    fn udp_datagram_roundtrip() {
        let target = Address::Domain("example.com".to_string(), 53);
        let encoded = encode_udp_datagram(&target, b"payload");
        assert_eq!(&encoded[..3], &[0, 0, 0]);

        let (addr, payload) = decode_udp_datagram(&encoded).unwrap();
        assert_eq!(addr, target);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn udp_datagram_rejects_fragments() {
        let target = Address::Ip("9.9.9.9:53".parse().unwrap());
        let mut encoded = encode_udp_datagram(&target, b"x");
        encoded[2] = 1;
        assert!(decode_udp_datagram(&encoded).is_err());
    }
}
