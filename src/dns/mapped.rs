//! Hostname ↔ virtual-address map.
//!
//! UDP DNS queries intercepted on the configured address are answered from
//! this table: each A-queried hostname gets a stable synthesized IPv4 from
//! the configured virtual subnet. When a flow later targets one of those
//! addresses, the reverse lookup recovers the hostname so the SOCKS5 CONNECT
//! can carry the name instead of the synthetic address.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;

use ipnet::Ipv4Net;
use tracing::debug;

use crate::config::MapDnsConfig;
use crate::dns::{build_dns_response, parse_dns_query, QTYPE_A};

/// TTL handed out in synthesized answers. Short, so clients re-ask and keep
/// the LRU order close to actual use.
const MAPPED_TTL_SECS: u32 = 60;

pub struct MappedDns {
    subnet: Ipv4Net,
    intercept: SocketAddrV4,
    capacity: usize,
    inner: Mutex<MapInner>,
}

struct MapInner {
    by_name: HashMap<String, Ipv4Addr>,
    by_ip: HashMap<Ipv4Addr, String>,
    /// LRU order: front oldest, back most recently used.
    order: VecDeque<String>,
    /// Rotating allocation cursor within the subnet.
    next_offset: u32,
}

impl MappedDns {
    pub fn new(config: &MapDnsConfig) -> Self {
        let subnet = config.subnet();
        // Entries can never outnumber usable host addresses.
        let capacity = config.cache_size.min(host_count(&subnet).max(1) as usize);
        debug!(
            subnet = %subnet,
            intercept = %config.address,
            port = config.port,
            capacity,
            "mapped dns initialized"
        );
        Self {
            subnet,
            intercept: SocketAddrV4::new(config.address, config.port),
            capacity,
            inner: Mutex::new(MapInner {
                by_name: HashMap::new(),
                by_ip: HashMap::new(),
                order: VecDeque::new(),
                next_offset: 0,
            }),
        }
    }

    /// The virtual DNS server address queries are intercepted on.
    pub fn intercept(&self) -> SocketAddr {
        SocketAddr::V4(self.intercept)
    }

    pub fn matches_intercept(&self, dst: SocketAddr) -> bool {
        match dst {
            SocketAddr::V4(v4) => v4 == self.intercept,
            SocketAddr::V6(_) => false,
        }
    }

    /// Whether `ip` belongs to the virtual subnet.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.subnet.contains(&v4),
            IpAddr::V6(_) => false,
        }
    }

    /// Answer one DNS query payload, or None for non-A/malformed input.
    pub fn handle(&self, query: &[u8]) -> Option<Vec<u8>> {
        let parsed = parse_dns_query(query)?;
        if parsed.qtype != QTYPE_A {
            return None;
        }
        let ip = self.allocate(&parsed.name);
        debug!(name = %parsed.name, %ip, "mapped dns answer");
        Some(build_dns_response(
            &parsed,
            &[IpAddr::V4(ip)],
            MAPPED_TTL_SECS,
        ))
    }

    /// Synthesize (or return the existing) address for `name`.
    pub fn allocate(&self, name: &str) -> Ipv4Addr {
        let name = name.to_lowercase();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(&ip) = inner.by_name.get(&name) {
            touch(&mut inner.order, &name);
            return ip;
        }

        if inner.by_name.len() >= self.capacity {
            evict_oldest(&mut inner);
        }

        let ip = self
            .probe_free(&inner)
            .unwrap_or_else(|| {
                // Subnet exhausted: reuse the oldest entry's slot.
                evict_oldest(&mut inner);
                self.probe_free(&inner)
                    .unwrap_or(self.subnet.addr())
            });

        // advance the cursor so consecutive names spread over the subnet
        let hosts = host_count(&self.subnet).max(1);
        let base = u32::from(self.subnet.network()) + first_host_offset(&self.subnet);
        inner.next_offset = u32::from(ip).wrapping_sub(base).wrapping_add(1) % hosts;

        inner.by_name.insert(name.clone(), ip);
        inner.by_ip.insert(ip, name.clone());
        inner.order.push_back(name);
        ip
    }

    /// Reverse lookup used when building the SOCKS5 CONNECT target.
    pub fn lookup_hostname(&self, ip: IpAddr) -> Option<String> {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return None,
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let name = inner.by_ip.get(&v4)?.clone();
        touch(&mut inner.order, &name);
        Some(name)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_name
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linear probe from the rotating cursor for an unused host address.
    fn probe_free(&self, inner: &MapInner) -> Option<Ipv4Addr> {
        let hosts = host_count(&self.subnet);
        if hosts == 0 {
            return None;
        }
        let base = u32::from(self.subnet.network());
        let first = first_host_offset(&self.subnet);
        for step in 0..hosts {
            let offset = first + (inner.next_offset + step) % hosts;
            let candidate = Ipv4Addr::from(base.wrapping_add(offset));
            if !inner.by_ip.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

fn touch(order: &mut VecDeque<String>, name: &str) {
    if let Some(pos) = order.iter().position(|n| n == name) {
        order.remove(pos);
    }
    order.push_back(name.to_string());
}

fn evict_oldest(inner: &mut MapInner) {
    if let Some(oldest) = inner.order.pop_front() {
        if let Some(ip) = inner.by_name.remove(&oldest) {
            inner.by_ip.remove(&ip);
            debug!(name = %oldest, %ip, "mapped dns evicted oldest entry");
        }
    }
}

/// Usable host addresses in the subnet, excluding network and broadcast for
/// prefixes shorter than /31.
fn host_count(subnet: &Ipv4Net) -> u32 {
    match subnet.prefix_len() {
        32 => 1,
        31 => 2,
        prefix => (1u64 << (32 - prefix)).saturating_sub(2) as u32,
    }
}

fn first_host_offset(subnet: &Ipv4Net) -> u32 {
    if subnet.prefix_len() >= 31 {
        0
    } else {
        1
    }
}
