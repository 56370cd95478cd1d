//! Minimal DNS wire codec for A-record lookups against pinned nameservers.

use std::net::Ipv4Addr;

const HEADER_LEN: usize = 12;

/// Record type A.
pub const TYPE_A: u16 = 1;
/// Class IN.
pub const CLASS_IN: u16 = 1;

/// An outgoing DNS question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Recursive A/IN query for `domain`.
    pub fn a_record(id: u16, domain: &str) -> Self {
        Self {
            id,
            domain: domain.trim_end_matches('.').to_lowercase(),
            qtype: TYPE_A,
            qclass: CLASS_IN,
        }
    }

    /// Encode to wire format. Labels longer than 63 bytes are rejected.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.domain.len() + 6);

        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&[0x01, 0x00]); // RD
        data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        for label in self.domain.split('.') {
            if label.is_empty() || label.len() > 63 {
                return None;
            }
            data.push(label.len() as u8);
            data.extend_from_slice(label.as_bytes());
        }
        data.push(0);

        data.extend_from_slice(&self.qtype.to_be_bytes());
        data.extend_from_slice(&self.qclass.to_be_bytes());

        Some(data)
    }
}

/// Response-side helpers.
pub struct DnsResponse;

impl DnsResponse {
    /// Extract the first A record from a response to query `id`.
    ///
    /// Returns `None` for a mismatched ID, a non-response, a non-zero RCODE,
    /// a truncated message, or an answer section without A records.
    pub fn first_a(response: &[u8], id: u16) -> Option<Ipv4Addr> {
        if response.len() < HEADER_LEN {
            return None;
        }
        if u16::from_be_bytes([response[0], response[1]]) != id {
            return None;
        }
        let flags = u16::from_be_bytes([response[2], response[3]]);
        if flags & 0x8000 == 0 || flags & 0x000F != 0 {
            return None;
        }

        let qdcount = u16::from_be_bytes([response[4], response[5]]) as usize;
        let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;

        let mut pos = HEADER_LEN;
        for _ in 0..qdcount {
            pos = Self::skip_name(response, pos)?;
            pos += 4; // QTYPE + QCLASS
        }

        for _ in 0..ancount {
            pos = Self::skip_name(response, pos)?;
            if pos + 10 > response.len() {
                return None;
            }

            let rtype = u16::from_be_bytes([response[pos], response[pos + 1]]);
            let class = u16::from_be_bytes([response[pos + 2], response[pos + 3]]);
            let rdlength = u16::from_be_bytes([response[pos + 8], response[pos + 9]]) as usize;
            pos += 10;
            if pos + rdlength > response.len() {
                return None;
            }

            if rtype == TYPE_A && class == CLASS_IN && rdlength == 4 {
                let rdata = &response[pos..pos + 4];
                return Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
            }
            pos += rdlength;
        }

        None
    }

    fn skip_name(data: &[u8], mut pos: usize) -> Option<usize> {
        while pos < data.len() {
            let b = data[pos];
            if b == 0 {
                return Some(pos + 1);
            }
            if b >= 0xC0 {
                return Some(pos + 2);
            }
            pos += 1 + b as usize;
        }
        None
    }
}
