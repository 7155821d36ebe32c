//! Passive DNS inspection over forwarded UDP payloads.
//!
//! The inspector is read-only: it never rewrites or suppresses a datagram.
//! Parse failures return `None` and the caller forwards the payload
//! unchanged.

pub mod cache;

pub use cache::DomainCache;

use smallvec::SmallVec;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const HEADER_LEN: usize = 12;
const FLAG_QR: u16 = 0x8000;
const MAX_POINTER_JUMPS: usize = 5;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;

/// The first question of a query message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
    pub qtype: u16,
}

/// One answer record. `address` is populated for A and AAAA records only;
/// other record types are skipped over but still reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub address: Option<IpAddr>,
    pub ttl: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DnsResponse {
    pub answers: SmallVec<[DnsAnswer; 4]>,
}

/// Parse the first question of a DNS query (QR bit clear).
pub fn parse_query(payload: &[u8]) -> Option<DnsQuery> {
    if payload.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    if flags & FLAG_QR != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    if qdcount == 0 {
        return None;
    }
    let mut cursor = HEADER_LEN;
    let name = read_name(payload, &mut cursor)?;
    let qtype_bytes = payload.get(cursor..cursor + 2)?;
    let qtype = u16::from_be_bytes([qtype_bytes[0], qtype_bytes[1]]);
    Some(DnsQuery { name, qtype })
}

/// Parse all answers of a DNS response (QR bit set).
pub fn parse_response(payload: &[u8]) -> Option<DnsResponse> {
    if payload.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    if flags & FLAG_QR == 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let ancount = u16::from_be_bytes([payload[6], payload[7]]) as usize;

    let mut cursor = HEADER_LEN;
    for _ in 0..qdcount {
        read_name(payload, &mut cursor)?;
        // question type + class
        payload.get(cursor..cursor + 4)?;
        cursor += 4;
    }

    let mut response = DnsResponse::default();
    for _ in 0..ancount {
        let name = read_name(payload, &mut cursor)?;
        let fixed = payload.get(cursor..cursor + 10)?;
        let record_type = u16::from_be_bytes([fixed[0], fixed[1]]);
        // class (fixed[2..4]) carries no information we use
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        cursor += 10;
        let rdata = payload.get(cursor..cursor + rdlength)?;
        cursor += rdlength;

        let address = match record_type {
            TYPE_A if rdlength == 4 => Some(IpAddr::V4(Ipv4Addr::new(
                rdata[0], rdata[1], rdata[2], rdata[3],
            ))),
            TYPE_AAAA if rdlength == 16 => {
                let mut groups = [0u16; 8];
                for (index, group) in groups.iter_mut().enumerate() {
                    *group = u16::from_be_bytes([rdata[index * 2], rdata[index * 2 + 1]]);
                }
                Some(IpAddr::V6(Ipv6Addr::new(
                    groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6],
                    groups[7],
                )))
            }
            _ => None,
        };
        response.answers.push(DnsAnswer { name, address, ttl });
    }
    Some(response)
}

/// Read a (possibly compressed) domain name starting at `*cursor`.
///
/// A pointer label jumps to an absolute offset; the first jump remembers the
/// post-pointer position so the caller's cursor resumes after the pointer
/// bytes. At most [`MAX_POINTER_JUMPS`] jumps are followed before the name is
/// rejected, which also bounds compression loops.
fn read_name(buf: &[u8], cursor: &mut usize) -> Option<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut position = *cursor;
    let mut jumped = false;
    let mut jumps = 0;
    loop {
        let len_byte = *buf.get(position)?;
        if len_byte == 0 {
            if !jumped {
                *cursor = position + 1;
            }
            break;
        }
        if len_byte & 0xC0 == 0xC0 {
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            let low = *buf.get(position + 1)?;
            let pointer = (usize::from(len_byte & 0x3F) << 8) | usize::from(low);
            if pointer >= buf.len() {
                return None;
            }
            if !jumped {
                *cursor = position + 2;
            }
            jumped = true;
            position = pointer;
            continue;
        }
        let len = usize::from(len_byte);
        if len > 63 {
            return None;
        }
        let label = buf.get(position + 1..position + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).to_string());
        position += 1 + len;
        if !jumped {
            *cursor = position;
        }
    }
    if labels.is_empty() {
        None
    } else {
        Some(labels.join("."))
    }
}
