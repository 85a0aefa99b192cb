//! UDP session: one inbound flow relayed through SOCKS5.
//!
//! Depending on configuration the upstream side is either a classic UDP
//! ASSOCIATE (datagrams on a UDP relay, control connection kept alive) or
//! UDP-in-TCP, where each SOCKS5-encapsulated datagram is length-prefixed
//! on a single TCP connection to the proxy.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use smoltcp::iface::SocketHandle;
use tracing::{debug, trace, warn};

use crate::common::{Address, Error, Result};
use crate::config::UdpMode;
use crate::dns::MappedDns;
use crate::proxy::{socks5, RelaySettings};
use crate::session::{FlowKey, SessionId, SessionRegistry};
use crate::stack::{ip_endpoint, socket_addr, SharedStack};

const DATAGRAM_BUF: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Handshaking,
    Relaying,
    Closed,
}

/// Upstream carrier for encapsulated datagrams.
enum UdpUpstream {
    Associate {
        socket: UdpSocket,
        relay: SocketAddr,
        /// The association dies with this connection; keep it open.
        _control: TcpStream,
    },
    Stream {
        stream: TcpStream,
        /// Unparsed bytes accumulated from the stream.
        pending: Vec<u8>,
    },
}

impl UdpUpstream {
    fn open(settings: &RelaySettings) -> Result<Self> {
        match settings.udp_mode {
            UdpMode::Udp => {
                let assoc = socks5::udp_associate(settings)?;
                let local = if assoc.relay_addr.is_ipv4() {
                    "0.0.0.0:0"
                } else {
                    "[::]:0"
                };
                let socket = UdpSocket::bind(local)?;
                socket.set_read_timeout(Some(settings.poll_interval))?;
                Ok(UdpUpstream::Associate {
                    socket,
                    relay: assoc.relay_addr,
                    _control: assoc.control,
                })
            }
            UdpMode::Tcp => {
                let stream = socks5::udp_over_tcp(settings)?;
                stream.set_read_timeout(Some(settings.poll_interval))?;
                Ok(UdpUpstream::Stream {
                    stream,
                    pending: Vec::new(),
                })
            }
        }
    }

    fn send(&mut self, target: &Address, payload: &[u8]) -> Result<()> {
        let datagram = socks5::encode_udp_datagram(target, payload);
        match self {
            UdpUpstream::Associate { socket, relay, .. } => {
                socket.send_to(&datagram, *relay)?;
            }
            UdpUpstream::Stream { stream, .. } => {
                let mut frame = Vec::with_capacity(2 + datagram.len());
                frame.extend_from_slice(&(datagram.len() as u16).to_be_bytes());
                frame.extend_from_slice(&datagram);
                stream.write_all(&frame)?;
            }
        }
        Ok(())
    }

    /// One decapsulated datagram, or None when nothing arrived within the
    /// read timeout.
    fn recv(&mut self, scratch: &mut [u8]) -> Result<Option<(Address, Vec<u8>)>> {
        match self {
            UdpUpstream::Associate { socket, .. } => match socket.recv_from(scratch) {
                Ok((n, _)) => {
                    let (addr, payload) = socks5::decode_udp_datagram(&scratch[..n])?;
                    Ok(Some((addr, payload.to_vec())))
                }
                Err(ref e) if is_transient(e) => Ok(None),
                Err(e) => Err(Error::Io(e)),
            },
            UdpUpstream::Stream { stream, pending } => {
                if let Some(frame) = split_frame(pending) {
                    let (addr, payload) = socks5::decode_udp_datagram(&frame)?;
                    return Ok(Some((addr, payload.to_vec())));
                }
                match stream.read(scratch) {
                    Ok(0) => Err(Error::Protocol("udp-in-tcp stream closed".into())),
                    Ok(n) => {
                        pending.extend_from_slice(&scratch[..n]);
                        match split_frame(pending) {
                            Some(frame) => {
                                let (addr, payload) = socks5::decode_udp_datagram(&frame)?;
                                Ok(Some((addr, payload.to_vec())))
                            }
                            None => Ok(None),
                        }
                    }
                    Err(ref e) if is_transient(e) => Ok(None),
                    Err(e) => Err(Error::Io(e)),
                }
            }
        }
    }
}

/// Take one complete length-prefixed frame off the front of `buf`.
fn split_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return None;
    }
    let frame = buf[2..2 + len].to_vec();
    buf.drain(..2 + len);
    Some(frame)
}

pub struct UdpSession {
    id: SessionId,
    key: FlowKey,
    handle: SocketHandle,
    stack: SharedStack,
    registry: Arc<SessionRegistry>,
    settings: Arc<RelaySettings>,
    mapdns: Option<Arc<MappedDns>>,
    cancel: Arc<AtomicBool>,
    state: State,
}

impl UdpSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        key: FlowKey,
        handle: SocketHandle,
        stack: SharedStack,
        registry: Arc<SessionRegistry>,
        settings: Arc<RelaySettings>,
        mapdns: Option<Arc<MappedDns>>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            key,
            handle,
            stack,
            registry,
            settings,
            mapdns,
            cancel,
            state: State::Handshaking,
        }
    }

    fn target_address(&self) -> Address {
        if let Some(dns) = &self.mapdns {
            if dns.contains(self.key.dst.ip()) {
                if let Some(host) = dns.lookup_hostname(self.key.dst.ip()) {
                    return Address::Domain(host, self.key.dst.port());
                }
            }
        }
        Address::Ip(self.key.dst)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn run(mut self) {
        if self.cancelled() {
            self.teardown();
            return;
        }

        let target = self.target_address();
        debug!(session = self.id, flow = %self.key, target = %target, "udp session starting");

        let mut upstream = match UdpUpstream::open(&self.settings) {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(session = self.id, flow = %self.key, error = %e, "socks5 udp setup failed");
                self.teardown();
                return;
            }
        };

        self.state = State::Relaying;
        self.relay(&mut upstream, &target);
        self.state = State::Closed;
        self.teardown();
        debug!(session = self.id, flow = %self.key, "udp session closed");
    }

    fn relay(&mut self, upstream: &mut UdpUpstream, target: &Address) {
        let mut peers: HashMap<SocketAddr, Instant> = HashMap::new();
        let mut scratch = vec![0u8; DATAGRAM_BUF];
        let mut last_activity = Instant::now();

        loop {
            if self.cancelled() {
                debug!(session = self.id, "udp session cancelled");
                return;
            }
            if last_activity.elapsed() > self.settings.udp_idle_timeout {
                debug!(session = self.id, "udp session idle timeout");
                return;
            }

            // inbound datagrams, fetched non-blocking under the stack lock
            let inbound = {
                let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
                stack.poll();
                let socket = stack.udp_socket(self.handle);
                let mut batch: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
                while socket.can_recv() {
                    match socket.recv() {
                        Ok((data, meta)) => {
                            batch.push((data.to_vec(), socket_addr(meta.endpoint)));
                        }
                        Err(_) => break,
                    }
                }
                batch
            };

            for (payload, peer) in inbound {
                if peers.insert(peer, Instant::now()).is_none() {
                    trace!(session = self.id, %peer, "new udp peer");
                }
                if let Err(e) = upstream.send(target, &payload) {
                    debug!(session = self.id, error = %e, "upstream udp send failed");
                    return;
                }
                last_activity = Instant::now();
            }

            // upstream responses; the timed recv is the loop's wait
            match upstream.recv(&mut scratch) {
                Ok(Some((_from, payload))) => {
                    let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
                    let reply_to = ip_endpoint(self.key.src);
                    {
                        let socket = stack.udp_socket(self.handle);
                        if socket.send_slice(&payload, reply_to).is_err() {
                            trace!(session = self.id, "inbound udp buffer full, datagram dropped");
                        }
                    }
                    stack.poll();
                    last_activity = Instant::now();
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(session = self.id, error = %e, "upstream udp recv failed");
                    return;
                }
            }
        }
    }

    fn teardown(&mut self) {
        {
            let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
            stack.remove_socket(self.handle);
            stack.poll();
        }
        self.registry.remove(self.id);
        debug!(session = self.id, state = ?self.state, "udp session torn down");
        self.state = State::Closed;
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MiscConfig, Socks5Config};
    use crate::session::FlowProto;
    use crate::stack::StackState;
    use crate::tun::PacketSender;
    use crossbeam::channel;

    #[test]
    fn split_frame_handles_partials() {
        let mut buf = Vec::new();
        assert!(split_frame(&mut buf).is_none());

        buf.extend_from_slice(&[0, 5]);
        assert!(split_frame(&mut buf).is_none());

        buf.extend_from_slice(b"hel");
        assert!(split_frame(&mut buf).is_none());

        buf.extend_from_slice(b"lo");
        assert_eq!(split_frame(&mut buf).unwrap(), b"hello");
        assert!(buf.is_empty());

        // two frames back to back
        buf.extend_from_slice(&[0, 1, b'a', 0, 1, b'b']);
        assert_eq!(split_frame(&mut buf).unwrap(), b"a");
        assert_eq!(split_frame(&mut buf).unwrap(), b"b");
    }

    #[test]
    fn failed_setup_cleans_up() {
        let (tx, _rx) = channel::bounded(64);
        let stack = StackState::new(
            std::net::Ipv4Addr::LOCALHOST,
            None,
            1500,
            PacketSender::for_queue(tx),
        )
        .shared();

        let key = FlowKey {
            proto: FlowProto::Udp,
            src: "198.18.0.1:5000".parse().unwrap(),
            dst: "9.9.9.9:53".parse().unwrap(),
        };
        let handle = stack.lock().unwrap().add_udp_socket(key.dst).unwrap();

        let registry = Arc::new(SessionRegistry::new(0));
        let (id, cancel) = registry.insert(key);

        let settings = Arc::new(RelaySettings::from_config(
            &Socks5Config {
                address: "127.0.0.1".to_string(),
                port: 1, // nothing listens here
                username: None,
                password: None,
                udp: UdpMode::Udp,
            },
            &MiscConfig {
                connect_timeout_ms: 200,
                ..Default::default()
            },
        ));

        let session = UdpSession::new(
            id,
            key,
            handle,
            Arc::clone(&stack),
            Arc::clone(&registry),
            settings,
            None,
            cancel,
        );
        session.run();
        assert!(registry.is_empty());
    }
}
