//! TCP session: one accepted inbound connection relayed over SOCKS5.
//!
//! The worker alternates between the two directions. Stack-side operations
//! take the stack lock for the duration of the call only; upstream socket
//! I/O happens strictly outside it, with the upstream read timeout acting as
//! the loop's wait primitive.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use smoltcp::iface::SocketHandle;
use tracing::{debug, warn};

use crate::common::Address;
use crate::dns::MappedDns;
use crate::proxy::{socks5, RelaySettings};
use crate::session::{FlowKey, SessionId, SessionRegistry};
use crate::stack::SharedStack;

/// Cap on bytes buffered per direction inside the session.
const RELAY_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Handshaking,
    Streaming,
    HalfClosed,
    Closed,
}

pub struct TcpSession {
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

impl TcpSession {
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

    /// CONNECT target: the flow's original destination, or the hostname
    /// behind a mapped-DNS address so the proxy resolves the real name.
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

    /// Relay until both directions are closed, then clean up. Runs as one
    /// task on the worker pool.
    pub fn run(mut self) {
        if self.cancelled() {
            self.teardown(true);
            return;
        }

        let target = self.target_address();
        debug!(session = self.id, flow = %self.key, target = %target, "tcp session connecting");

        let upstream = match socks5::connect_tcp(&self.settings, &target) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = self.id, flow = %self.key, error = %e, "socks5 connect failed");
                self.teardown(true);
                return;
            }
        };
        if upstream
            .set_read_timeout(Some(self.settings.poll_interval))
            .is_err()
        {
            self.teardown(true);
            return;
        }

        self.state = State::Streaming;
        self.relay(&upstream);
        self.state = State::Closed;
        self.teardown(false);
        debug!(session = self.id, flow = %self.key, "tcp session closed");
    }

    fn relay(&mut self, upstream: &TcpStream) {
        let mut up_buf: Vec<u8> = Vec::with_capacity(RELAY_BUF_SIZE);
        let mut down_buf: Vec<u8> = Vec::with_capacity(RELAY_BUF_SIZE);
        let mut rbuf = vec![0u8; RELAY_BUF_SIZE];

        let mut inbound_eof = false;
        let mut inbound_dead = false;
        let mut upstream_eof = false;
        let mut upstream_shut = false;
        let mut last_activity = Instant::now();

        loop {
            if self.cancelled() {
                debug!(session = self.id, "tcp session cancelled");
                return;
            }
            if last_activity.elapsed() > self.settings.rw_timeout {
                debug!(session = self.id, "tcp session idle timeout");
                return;
            }

            let mut progressed = false;

            // inbound → buffer, under the stack lock
            if up_buf.is_empty() && !inbound_eof {
                let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
                stack.poll();
                let mut received = false;
                {
                    let socket = stack.tcp_socket(self.handle);
                    while socket.can_recv() && up_buf.len() < RELAY_BUF_SIZE {
                        match socket.recv_slice(&mut rbuf) {
                            Ok(0) => break,
                            Ok(n) => {
                                up_buf.extend_from_slice(&rbuf[..n]);
                                received = true;
                            }
                            Err(_) => break,
                        }
                    }
                    if !socket.can_recv() && !socket.may_recv() {
                        inbound_eof = true;
                    }
                    if !socket.is_active() {
                        inbound_dead = true;
                    }
                }
                if received {
                    // emit the window update right away
                    stack.poll();
                    progressed = true;
                    last_activity = Instant::now();
                }
            }

            // buffer → upstream, outside the lock
            if !up_buf.is_empty() {
                use std::io::Write;
                match (&*upstream).write(&up_buf) {
                    Ok(0) => return,
                    Ok(n) => {
                        up_buf.drain(..n);
                        progressed = true;
                        last_activity = Instant::now();
                    }
                    Err(ref e) if is_transient(e) => {}
                    Err(e) => {
                        debug!(session = self.id, error = %e, "upstream write failed");
                        return;
                    }
                }
            }

            // propagate inbound FIN once its data is flushed
            if inbound_eof && up_buf.is_empty() && !upstream_shut {
                let _ = upstream.shutdown(Shutdown::Write);
                upstream_shut = true;
                self.state = State::HalfClosed;
                debug!(session = self.id, "inbound closed, upstream write shut down");
            }

            // upstream → buffer; the timed read is where the loop waits
            if down_buf.is_empty() && !upstream_eof {
                use std::io::Read;
                match (&*upstream).read(&mut rbuf) {
                    Ok(0) => {
                        upstream_eof = true;
                        self.state = State::HalfClosed;
                        let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
                        stack.tcp_socket(self.handle).close();
                        stack.poll();
                        debug!(session = self.id, "upstream EOF, inbound write shut down");
                    }
                    Ok(n) => {
                        down_buf.extend_from_slice(&rbuf[..n]);
                        progressed = true;
                        last_activity = Instant::now();
                    }
                    Err(ref e) if is_transient(e) => {}
                    Err(e) => {
                        debug!(session = self.id, error = %e, "upstream read failed");
                        return;
                    }
                }
            }

            // buffer → inbound socket, under the stack lock; zero-progress
            // here means the stack has no buffer space and we back off
            if !down_buf.is_empty() {
                let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
                let mut sent = 0usize;
                {
                    let socket = stack.tcp_socket(self.handle);
                    if !socket.may_send() {
                        inbound_dead = true;
                    } else if let Ok(n) = socket.send_slice(&down_buf) {
                        sent = n;
                    }
                }
                if sent > 0 {
                    stack.poll();
                    down_buf.drain(..sent);
                    progressed = true;
                    last_activity = Instant::now();
                }
            }

            if inbound_dead && up_buf.is_empty() {
                return;
            }
            if inbound_eof && upstream_eof {
                let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
                stack.poll();
                let socket = stack.tcp_socket(self.handle);
                if socket.send_queue() == 0 || !socket.is_active() {
                    return;
                }
            }

            if !progressed {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
    }

    /// Destroy the inbound endpoint under the stack lock and drop the
    /// registry entry. `abort` resets instead of closing gracefully.
    fn teardown(&mut self, abort: bool) {
        {
            let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
            {
                let socket = stack.tcp_socket(self.handle);
                if abort {
                    socket.abort();
                } else {
                    socket.close();
                }
            }
            stack.poll();
            stack.remove_socket(self.handle);
        }
        self.registry.remove(self.id);
        debug!(session = self.id, state = ?self.state, "tcp session torn down");
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
    use crate::config::{MiscConfig, Socks5Config, UdpMode};
    use crate::session::FlowProto;
    use crate::stack::StackState;
    use crate::tun::PacketSender;
    use crossbeam::channel;

    fn test_settings() -> Arc<RelaySettings> {
        Arc::new(RelaySettings::from_config(
            &Socks5Config {
                // Nothing listens here: connects fail fast.
                address: "127.0.0.1".to_string(),
                port: 1,
                username: None,
                password: None,
                udp: UdpMode::Udp,
            },
            &MiscConfig {
                connect_timeout_ms: 200,
                ..Default::default()
            },
        ))
    }

    fn test_session(cancelled: bool) -> (TcpSession, Arc<SessionRegistry>, SharedStack) {
        let (tx, _rx) = channel::bounded(64);
        let sender = PacketSender::for_queue(tx);
        let stack =
            StackState::new(std::net::Ipv4Addr::LOCALHOST, None, 1500, sender).shared();

        let key = FlowKey {
            proto: FlowProto::Tcp,
            src: "198.18.0.1:50000".parse().unwrap(),
            dst: "1.1.1.1:80".parse().unwrap(),
        };
        let handle = stack
            .lock()
            .unwrap()
            .add_tcp_listener(key.dst)
            .unwrap();

        let registry = Arc::new(SessionRegistry::new(0));
        let (id, cancel) = registry.insert(key);
        cancel.store(cancelled, Ordering::Release);

        let session = TcpSession::new(
            id,
            key,
            handle,
            Arc::clone(&stack),
            Arc::clone(&registry),
            test_settings(),
            None,
            cancel,
        );
        (session, registry, stack)
    }

    #[test]
    fn cancelled_session_cleans_up_immediately() {
        let (session, registry, _stack) = test_session(true);
        session.run();
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_connect_cleans_up() {
        let (session, registry, _stack) = test_session(false);
        session.run();
        assert!(registry.is_empty());
    }

    #[test]
    fn target_prefers_mapped_hostname() {
        use crate::config::MapDnsConfig;
        use crate::dns::MappedDns;

        let mapdns = Arc::new(MappedDns::new(&MapDnsConfig {
            network: "198.19.0.0".parse().unwrap(),
            netmask: "255.255.0.0".parse().unwrap(),
            cache_size: 16,
            address: "198.18.0.53".parse().unwrap(),
            port: 53,
        }));
        let mapped_ip = mapdns.allocate("example.com");

        let (mut session, _registry, _stack) = test_session(false);
        session.key.dst = std::net::SocketAddr::new(mapped_ip.into(), 443);
        session.mapdns = Some(mapdns);

        assert_eq!(
            session.target_address(),
            Address::Domain("example.com".to_string(), 443)
        );

        session.key.dst = "1.1.1.1:443".parse().unwrap();
        assert_eq!(
            session.target_address(),
            Address::Ip("1.1.1.1:443".parse().unwrap())
        );
    }
}
