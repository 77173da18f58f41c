//! DNS message parsing and construction.
//!
//! Handles single-question UDP messages only: enough to decode an inbound
//! query and encode an authoritative answer, NXDOMAIN, or REFUSED reply.

use thiserror::Error;

const HEADER_LEN: usize = 12;

/// QTYPE for A records.
pub const TYPE_A: u16 = 1;
/// QTYPE for TXT records.
pub const TYPE_TXT: u16 = 16;

/// QR + AA set; the low four bits carry the response code.
const RESPONSE_FLAGS: u16 = 0x8400;
/// RD bit, echoed from the query.
const FLAG_RD: u16 = 0x0100;

/// Reasons an inbound buffer fails to decode.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("packet shorter than DNS header")]
    Truncated,
    #[error("label extends past end of packet")]
    TruncatedLabel,
    #[error("label is not valid UTF-8")]
    InvalidLabel,
    #[error("question has an empty name")]
    EmptyName,
    #[error("question section truncated")]
    TruncatedQuestion,
}

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    /// Lowercased, no trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN + 1 {
            return Err(DecodeError::Truncated);
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);

        // Parse question name
        let mut pos = HEADER_LEN;
        let mut labels = Vec::new();

        while pos < data.len() {
            let label_len = data[pos] as usize;
            if label_len == 0 {
                pos += 1;
                break;
            }
            pos += 1;
            if pos + label_len > data.len() {
                return Err(DecodeError::TruncatedLabel);
            }
            let label = std::str::from_utf8(&data[pos..pos + label_len])
                .map_err(|_| DecodeError::InvalidLabel)?;
            labels.push(label.to_lowercase());
            pos += label_len;
        }

        if labels.is_empty() {
            return Err(DecodeError::EmptyName);
        }

        if pos + 4 > data.len() {
            return Err(DecodeError::TruncatedQuestion);
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);

        Ok(Self {
            id,
            flags,
            name: labels.join("."),
            qtype,
            qclass,
        })
    }
}

/// DNS response codes used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    NxDomain,
    Refused,
}

impl Rcode {
    fn code(self) -> u16 {
        match self {
            Rcode::NoError => 0,
            Rcode::NxDomain => 3,
            Rcode::Refused => 5,
        }
    }
}

/// A DNS resource record.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    /// RDATA for an A record (four octets).
    pub fn a_rdata(addr: std::net::Ipv4Addr) -> Vec<u8> {
        addr.octets().to_vec()
    }

    /// RDATA for a TXT record: 255-byte chunked character-strings.
    pub fn txt_rdata(text: &str) -> Vec<u8> {
        let bytes = text.as_bytes();
        let mut rdata = Vec::with_capacity(bytes.len() + bytes.len() / 255 + 1);
        if bytes.is_empty() {
            rdata.push(0);
            return rdata;
        }
        for chunk in bytes.chunks(255) {
            rdata.push(chunk.len() as u8);
            rdata.extend_from_slice(chunk);
        }
        rdata
    }
}

/// A DNS response echoing a single question.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub rcode: Rcode,
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    pub answers: Vec<DnsRecord>,
}

impl DnsResponse {
    fn reply(query: &DnsQuery, rcode: Rcode, answers: Vec<DnsRecord>) -> Self {
        Self {
            id: query.id,
            flags: RESPONSE_FLAGS | (query.flags & FLAG_RD) | rcode.code(),
            rcode,
            name: query.name.clone(),
            qtype: query.qtype,
            qclass: query.qclass,
            answers,
        }
    }

    /// Successful authoritative answer.
    pub fn answer(query: &DnsQuery, answers: Vec<DnsRecord>) -> Self {
        Self::reply(query, Rcode::NoError, answers)
    }

    /// Name or record does not exist.
    pub fn nxdomain(query: &DnsQuery) -> Self {
        Self::reply(query, Rcode::NxDomain, Vec::new())
    }

    /// Refused by admission control.
    pub fn refused(query: &DnsQuery) -> Self {
        Self::reply(query, Rcode::Refused, Vec::new())
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        // Question
        encode_domain(&mut data, &self.name);
        data.extend_from_slice(&self.qtype.to_be_bytes());
        data.extend_from_slice(&self.qclass.to_be_bytes());

        // Answers
        for a in &self.answers {
            // Use a compression pointer when the owner is the question's name
            if a.name == self.name {
                data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to offset 12
            } else {
                encode_domain(&mut data, &a.name);
            }
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}
