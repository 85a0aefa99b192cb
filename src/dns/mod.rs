//! Minimal DNS wire handling for the mapped-DNS responder.
//!
//! Only what the responder needs: pull the question out of a query and build
//! an answer that echoes the ID and question section. Anything else (EDNS,
//! compression in queries, multiple questions) is treated as unanswerable
//! and dropped by the caller.

pub mod mapped;

use std::net::IpAddr;

pub use mapped::MappedDns;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;

pub struct DnsQuery {
    pub id: u16,
    pub name: String,
    pub qtype: u16,
    /// Complete question section, reused verbatim in the response.
    pub raw_question: Vec<u8>,
}

pub fn parse_dns_query(data: &[u8]) -> Option<DnsQuery> {
    if data.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);

    // QR must be 0 (query)
    if flags & 0x8000 != 0 {
        return None;
    }

    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut pos = 12;
    let mut name_parts: Vec<String> = Vec::new();

    loop {
        if pos >= data.len() {
            return None;
        }
        let label_len = data[pos] as usize;
        if label_len == 0 {
            pos += 1;
            break;
        }
        // compression pointers do not belong in a question name
        if label_len & 0xC0 == 0xC0 {
            return None;
        }
        pos += 1;
        if pos + label_len > data.len() {
            return None;
        }
        let label = std::str::from_utf8(&data[pos..pos + label_len]).ok()?;
        name_parts.push(label.to_string());
        pos += label_len;
    }

    if name_parts.is_empty() {
        return None;
    }

    if pos + 4 > data.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
    pos += 4; // QTYPE + QCLASS

    Some(DnsQuery {
        id,
        name: name_parts.join("."),
        qtype,
        raw_question: data[12..pos].to_vec(),
    })
}

/// Build a response for `query` answering with `addrs` (filtered by qtype).
pub fn build_dns_response(query: &DnsQuery, addrs: &[IpAddr], ttl: u32) -> Vec<u8> {
    let matched: Vec<&IpAddr> = addrs
        .iter()
        .filter(|addr| {
            matches!(
                (query.qtype, addr),
                (QTYPE_A, IpAddr::V4(_)) | (QTYPE_AAAA, IpAddr::V6(_))
            )
        })
        .collect();

    let mut resp = Vec::with_capacity(12 + query.raw_question.len() + matched.len() * 28);

    resp.extend_from_slice(&query.id.to_be_bytes());
    resp.extend_from_slice(&0x8180u16.to_be_bytes()); // QR=1, RD=1, RA=1
    resp.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    resp.extend_from_slice(&(matched.len() as u16).to_be_bytes()); // ANCOUNT
    resp.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    resp.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    resp.extend_from_slice(&query.raw_question);

    for addr in &matched {
        // NAME: pointer to the question name at offset 0x0C
        resp.extend_from_slice(&0xC00Cu16.to_be_bytes());
        match addr {
            IpAddr::V4(v4) => {
                resp.extend_from_slice(&QTYPE_A.to_be_bytes());
                resp.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
                resp.extend_from_slice(&ttl.to_be_bytes());
                resp.extend_from_slice(&4u16.to_be_bytes());
                resp.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                resp.extend_from_slice(&QTYPE_AAAA.to_be_bytes());
                resp.extend_from_slice(&1u16.to_be_bytes());
                resp.extend_from_slice(&ttl.to_be_bytes());
                resp.extend_from_slice(&16u16.to_be_bytes());
                resp.extend_from_slice(&v6.octets());
            }
        }
    }

    resp
}

/// Encode a bare query for tests and tooling.
pub fn build_dns_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + name.len() + 6);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&[0u8; 6]); // AN/NS/AR
    for label in name.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
    buf
}
