//! Embedded TCP/IP stack (smoltcp) behind the stack lock.
//!
//! The stack is single-threaded by construction: every call into it — packet
//! injection, socket operations, timer polls — goes through the one
//! `Mutex<StackState>`. Parallelism lives at the endpoints instead: TUN
//! reader/writer threads and session workers spend their time outside the
//! lock, and no caller may hold it across upstream socket I/O.

pub mod device;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tracing::debug;

use crate::common::{Error, Result};
use crate::tun::PacketSender;

pub use device::VirtualDevice;

/// Per-direction TCP buffer.
const TCP_BUF_SIZE: usize = 65536;
/// UDP socket buffers: datagram slots and payload bytes.
const UDP_META_SLOTS: usize = 16;
const UDP_BUF_SIZE: usize = 65536;

pub struct StackState {
    device: VirtualDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
}

/// The stack lock. Guards the interface, the socket set and the virtual
/// device as one unit.
pub type SharedStack = Arc<Mutex<StackState>>;

impl StackState {
    /// Build the interface over a virtual device whose TX side feeds the
    /// packet queue. `any_ip` makes the stack accept every destination the
    /// host routes into the TUN, so listeners can bind to arbitrary flows.
    pub fn new(
        local_v4: Ipv4Addr,
        local_v6: Option<Ipv6Addr>,
        mtu: u16,
        tx: PacketSender,
    ) -> Self {
        let mut device = VirtualDevice::new(mtu as usize, tx);

        let mut config = Config::new(HardwareAddress::Ip);
        config.random_seed = rand::random();
        let mut iface = Interface::new(config, &mut device, Instant::now());

        iface.update_ip_addrs(|addrs| {
            addrs
                .push(IpCidr::new(IpAddress::Ipv4(local_v4), 32))
                .ok();
            if let Some(v6) = local_v6 {
                addrs.push(IpCidr::new(IpAddress::Ipv6(v6), 128)).ok();
            }
        });
        iface.set_any_ip(true);
        iface.routes_mut().add_default_ipv4_route(local_v4).ok();
        iface
            .routes_mut()
            .add_default_ipv6_route(local_v6.unwrap_or(Ipv6Addr::LOCALHOST))
            .ok();

        debug!(%local_v4, mtu, "embedded stack initialized");

        Self {
            device,
            iface,
            sockets: SocketSet::new(vec![]),
        }
    }

    pub fn shared(self) -> SharedStack {
        Arc::new(Mutex::new(self))
    }

    /// Feed one inbound packet and let the stack process it.
    pub fn input(&mut self, packet: Vec<u8>) {
        self.device.inject(packet);
        self.poll();
    }

    /// Drive protocol state: delivers queued RX packets, runs TCP timers
    /// (retransmit, delayed ACK) and emits anything due on the TX side.
    pub fn poll(&mut self) {
        let timestamp = Instant::now();
        self.iface
            .poll(timestamp, &mut self.device, &mut self.sockets);
    }

    /// Create a TCP socket listening on the flow's original destination, so
    /// the SYN already sitting in the RX queue is accepted by it.
    pub fn add_tcp_listener(&mut self, dst: SocketAddr) -> Result<SocketHandle> {
        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_BUF_SIZE]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_BUF_SIZE]);
        let mut socket = tcp::Socket::new(rx, tx);
        socket
            .listen(IpListenEndpoint {
                addr: Some(ip_address(dst.ip())),
                port: dst.port(),
            })
            .map_err(|e| Error::Stack(format!("tcp listen on {} failed: {:?}", dst, e)))?;
        Ok(self.sockets.add(socket))
    }

    /// Create a UDP socket bound to the flow's original destination.
    pub fn add_udp_socket(&mut self, dst: SocketAddr) -> Result<SocketHandle> {
        let rx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_META_SLOTS],
            vec![0u8; UDP_BUF_SIZE],
        );
        let tx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_META_SLOTS],
            vec![0u8; UDP_BUF_SIZE],
        );
        let mut socket = udp::Socket::new(rx, tx);
        socket
            .bind(IpListenEndpoint {
                addr: Some(ip_address(dst.ip())),
                port: dst.port(),
            })
            .map_err(|e| Error::Stack(format!("udp bind on {} failed: {:?}", dst, e)))?;
        Ok(self.sockets.add(socket))
    }

    pub fn tcp_socket(&mut self, handle: SocketHandle) -> &mut tcp::Socket<'static> {
        self.sockets.get_mut::<tcp::Socket>(handle)
    }

    pub fn udp_socket(&mut self, handle: SocketHandle) -> &mut udp::Socket<'static> {
        self.sockets.get_mut::<udp::Socket>(handle)
    }

    /// Destroy a socket. Callers close gracefully first where possible.
    pub fn remove_socket(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }
}

pub fn ip_address(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6),
    }
}

pub fn ip_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(ip_address(addr.ip()), addr.port())
}

pub fn socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    let ip = match endpoint.addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6),
    };
    SocketAddr::new(ip, endpoint.port)
}


#[cfg(test)]
pub(crate) mod tests_support {
    use std::net::SocketAddr;

    /// Build an IPv4 TCP segment with valid IP and TCP checksums, for
    /// driving the stack from tests without a real peer.
    pub fn build_ipv4_tcp_packet(
        src: SocketAddr,
        dst: SocketAddr,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let (src_ip, dst_ip) = match (src.ip(), dst.ip()) {
            (std::net::IpAddr::V4(s), std::net::IpAddr::V4(d)) => (s, d),
            _ => panic!("ipv4 only"),
        };

        let total_len = 20 + 20 + payload.len();
        let mut packet = vec![0u8; total_len];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        packet[8] = 64;
        packet[9] = 6;
        packet[12..16].copy_from_slice(&src_ip.octets());
        packet[16..20].copy_from_slice(&dst_ip.octets());

        packet[20..22].copy_from_slice(&src.port().to_be_bytes());
        packet[22..24].copy_from_slice(&dst.port().to_be_bytes());
        packet[24..28].copy_from_slice(&seq.to_be_bytes());
        packet[28..32].copy_from_slice(&ack.to_be_bytes());
        packet[32] = 5 << 4;
        packet[33] = flags;
        packet[34..36].copy_from_slice(&65535u16.to_be_bytes());
        packet[40..].copy_from_slice(payload);

        let ip_csum = checksum(&packet[..20], 0);
        packet[10..12].copy_from_slice(&ip_csum.to_be_bytes());

        let mut pseudo: u32 = 0;
        for chunk in src_ip.octets().chunks(2).chain(dst_ip.octets().chunks(2)) {
            pseudo += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        pseudo += 6;
        pseudo += (20 + payload.len()) as u32;
        let tcp_csum = checksum(&packet[20..], pseudo);
        packet[36..38].copy_from_slice(&tcp_csum.to_be_bytes());

        packet
    }

    fn checksum(data: &[u8], initial: u32) -> u16 {
        let mut sum = initial;
        let mut i = 0;
        while i + 1 < data.len() {
            sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
            i += 2;
        }
        if i < data.len() {
            sum += (data[i] as u32) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}
