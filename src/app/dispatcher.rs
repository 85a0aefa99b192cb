//! Inbound packet dispatch.
//!
//! Runs on the TUN reader threads. Each packet is classified before the
//! stack sees it: packets of known flows are injected directly, a TCP SYN
//! or first UDP datagram of an unknown flow sets up the stack socket and a
//! session task, and DNS queries aimed at the mapped-DNS address are
//! answered on the spot without ever creating a session.
//!
//! Session construction happens after the stack lock is released; there is
//! a brief window in which the stack knows the flow but the registry does
//! not, which the accept path tolerates by keying on the registry last.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::dns::MappedDns;
use crate::pool::ThreadPool;
use crate::proxy::RelaySettings;
use crate::session::{FlowKey, FlowProto, SessionRegistry, TcpSession, UdpSession};
use crate::stack::SharedStack;
use crate::tun::packet::{
    build_ipv4_udp_packet, parse_ip_packet, tcp_flags, udp_payload, IpProtocol, ParsedPacket,
    TCP_FLAG_ACK, TCP_FLAG_SYN,
};
use crate::tun::PacketSender;

pub struct Dispatcher {
    stack: SharedStack,
    registry: Arc<SessionRegistry>,
    pool: Arc<ThreadPool>,
    packets: PacketSender,
    mapdns: Option<Arc<MappedDns>>,
    settings: Arc<RelaySettings>,
}

impl Dispatcher {
    pub fn new(
        stack: SharedStack,
        registry: Arc<SessionRegistry>,
        pool: Arc<ThreadPool>,
        packets: PacketSender,
        mapdns: Option<Arc<MappedDns>>,
        settings: Arc<RelaySettings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stack,
            registry,
            pool,
            packets,
            mapdns,
            settings,
        })
    }

    /// Entry point for every packet read off the TUN.
    pub fn ingest(&self, packet: Vec<u8>) {
        let parsed = match parse_ip_packet(&packet) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(error = %e, "dropped unparseable packet");
                return;
            }
        };

        match parsed.protocol {
            IpProtocol::Tcp => self.handle_tcp(&parsed, packet),
            IpProtocol::Udp => self.handle_udp(&parsed, packet),
            IpProtocol::Icmp => trace!(src = %parsed.src_ip, dst = %parsed.dst_ip, "icmp dropped"),
            IpProtocol::Other(proto) => {
                trace!(protocol = proto, "unsupported transport protocol dropped")
            }
        }
    }

    fn handle_tcp(&self, parsed: &ParsedPacket, packet: Vec<u8>) {
        let key = FlowKey {
            proto: FlowProto::Tcp,
            src: SocketAddr::new(parsed.src_ip, parsed.src_port),
            dst: SocketAddr::new(parsed.dst_ip, parsed.dst_port),
        };

        if self.registry.contains(&key) {
            self.stack
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .input(packet);
            return;
        }

        let flags = tcp_flags(parsed, &packet).unwrap_or(0);
        let is_syn = flags & TCP_FLAG_SYN != 0 && flags & TCP_FLAG_ACK == 0;
        if !is_syn {
            // Stray segment of a dead flow: hand it to the stack, which
            // answers unknown TCP with a reset.
            self.stack
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .input(packet);
            return;
        }

        let handle = {
            let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
            match stack.add_tcp_listener(key.dst) {
                Ok(handle) => {
                    stack.input(packet);
                    handle
                }
                Err(e) => {
                    warn!(flow = %key, error = %e, "tcp accept failed");
                    return;
                }
            }
        };

        let (id, cancel) = self.registry.insert(key);
        let session = TcpSession::new(
            id,
            key,
            handle,
            Arc::clone(&self.stack),
            Arc::clone(&self.registry),
            Arc::clone(&self.settings),
            self.mapdns.clone(),
            cancel,
        );
        if self.pool.submit(Box::new(move || session.run())).is_err() {
            warn!(flow = %key, "task queue full, dropping tcp flow");
            self.registry.remove(id);
            let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
            stack.tcp_socket(handle).abort();
            stack.poll();
            stack.remove_socket(handle);
        } else {
            debug!(session = id, flow = %key, "tcp flow accepted");
        }
    }

    fn handle_udp(&self, parsed: &ParsedPacket, packet: Vec<u8>) {
        let dst = SocketAddr::new(parsed.dst_ip, parsed.dst_port);

        if let Some(dns) = &self.mapdns {
            if dns.matches_intercept(dst) {
                self.answer_mapped_dns(dns, parsed, &packet);
                return;
            }
        }

        let key = FlowKey {
            proto: FlowProto::Udp,
            src: SocketAddr::new(parsed.src_ip, parsed.src_port),
            dst,
        };

        if self.registry.contains(&key) {
            self.stack
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .input(packet);
            return;
        }

        let handle = {
            let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
            match stack.add_udp_socket(key.dst) {
                Ok(handle) => {
                    stack.input(packet);
                    handle
                }
                Err(e) => {
                    warn!(flow = %key, error = %e, "udp receive setup failed");
                    return;
                }
            }
        };

        let (id, cancel) = self.registry.insert(key);
        let session = UdpSession::new(
            id,
            key,
            handle,
            Arc::clone(&self.stack),
            Arc::clone(&self.registry),
            Arc::clone(&self.settings),
            self.mapdns.clone(),
            cancel,
        );
        if self.pool.submit(Box::new(move || session.run())).is_err() {
            warn!(flow = %key, "task queue full, dropping udp flow");
            self.registry.remove(id);
            let mut stack = self.stack.lock().unwrap_or_else(|e| e.into_inner());
            stack.remove_socket(handle);
        } else {
            debug!(session = id, flow = %key, "udp flow accepted");
        }
    }

    /// Answer an intercepted DNS query synchronously: the response packet
    /// goes straight onto the packet queue, no stack or session involved.
    fn answer_mapped_dns(&self, dns: &MappedDns, parsed: &ParsedPacket, packet: &[u8]) {
        let Some(payload) = udp_payload(parsed, packet) else {
            return;
        };
        let Some(response) = dns.handle(payload) else {
            trace!(src = %parsed.src_ip, "mapped dns dropped query");
            return;
        };
        let (client_ip, dns_ip) = match (parsed.src_ip, parsed.dst_ip) {
            (std::net::IpAddr::V4(src), std::net::IpAddr::V4(dst)) => (src, dst),
            _ => return, // intercept address is IPv4
        };
        let reply = build_ipv4_udp_packet(
            dns_ip,
            client_ip,
            parsed.dst_port,
            parsed.src_port,
            &response,
        );
        self.packets.push(reply);
    }
}
