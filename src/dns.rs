//! Minimal DNS wire codec for the tunnel transport.
//!
//! Implements just enough of RFC 1035 to build TXT queries carrying
//! base32-encoded upstream data and to parse TXT responses coming back
//! through a recursive resolver:
//!
//! - Queries: one TXT/IN question plus an EDNS0 OPT record advertising a
//!   4096-byte UDP payload.
//! - Responses: header flags, rcode, and all resource records, including
//!   compressed names (resolvers rewrite names freely).
//! - TXT RDATA: length-prefixed character-strings, packed and unpacked.

use bytes::{BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

/// TXT record type.
pub const RR_TYPE_TXT: u16 = 16;
/// OPT pseudo-record type (EDNS0).
pub const RR_TYPE_OPT: u16 = 41;
/// Internet class.
pub const CLASS_IN: u16 = 1;

/// QR bit: message is a response.
pub const FLAG_RESPONSE: u16 = 0x8000;
/// Standard query with recursion desired.
pub const FLAG_QUERY_RD: u16 = 0x0100;
/// Rcode for a successful response.
pub const RCODE_NO_ERROR: u16 = 0;

/// UDP payload size advertised in the OPT record.
pub const UDP_PAYLOAD_SIZE: u16 = 4096;

/// Maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;
/// Maximum wire length of a name, including the root byte.
pub const MAX_NAME_LEN: usize = 255;

/// Compression pointers a single name is allowed to follow.
const MAX_POINTER_JUMPS: usize = 16;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("label exceeds {MAX_LABEL_LEN} bytes")]
    LabelTooLong,

    #[error("empty label")]
    EmptyLabel,

    #[error("name exceeds {MAX_NAME_LEN} bytes on the wire")]
    NameTooLong,

    #[error("malformed message: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, DnsError>;

fn truncated(what: &str) -> DnsError {
    DnsError::Parse(format!("truncated {}", what))
}

/// A domain name as a sequence of raw labels.
///
/// Labels are kept as bytes, not text: the upstream labels of a tunnel
/// query are base32 output and never pass through a string type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name(Vec<Vec<u8>>);

impl Name {
    /// Build a name from labels, enforcing the wire-format limits.
    pub fn new(labels: Vec<Vec<u8>>) -> Result<Self> {
        let mut wire_len = 1usize;
        for label in &labels {
            if label.is_empty() {
                return Err(DnsError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(DnsError::LabelTooLong);
            }
            wire_len += label.len() + 1;
        }
        if wire_len > MAX_NAME_LEN {
            return Err(DnsError::NameTooLong);
        }
        Ok(Name(labels))
    }

    /// The root name (zero labels).
    pub fn root() -> Self {
        Name(Vec::new())
    }

    /// Parse a dotted name. A single trailing dot is accepted. Letters
    /// are lowercased; DNS names are compared case-insensitively and the
    /// tunnel only ever emits lowercase.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return Ok(Name::root());
        }
        let labels = s
            .split('.')
            .map(|l| l.as_bytes().to_ascii_lowercase())
            .collect();
        Name::new(labels)
    }

    pub fn labels(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Length of the name in wire format, including the terminating zero.
    pub fn wire_len(&self) -> usize {
        self.0.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// Whether `suffix` matches the tail labels of this name.
    pub fn ends_with(&self, suffix: &Name) -> bool {
        let n = self.0.len();
        let m = suffix.0.len();
        if m > n {
            return false;
        }
        self.0[n - m..]
            .iter()
            .zip(&suffix.0)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    fn write(&self, buf: &mut BytesMut) {
        for label in &self.0 {
            buf.put_u8(label.len() as u8);
            buf.put_slice(label);
        }
        buf.put_u8(0);
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, ".");
        }
        for label in &self.0 {
            for &b in label {
                if b.is_ascii_graphic() && b != b'.' && b != b'\\' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\{:03}", b)?;
                }
            }
            write!(f, ".")?;
        }
        Ok(())
    }
}

/// A question section entry.
#[derive(Debug, Clone)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    pub qclass: u16,
}

/// A resource record. For OPT records `class` carries the UDP payload
/// size, per EDNS0.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

/// A DNS message, query or response.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Message {
    /// Build a TXT query for `name` with a fresh random transaction ID
    /// and the EDNS0 OPT record the tunnel always attaches.
    pub fn query(name: Name) -> Self {
        Message {
            id: rand::random(),
            flags: FLAG_QUERY_RD,
            questions: vec![Question {
                name,
                qtype: RR_TYPE_TXT,
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: vec![ResourceRecord {
                name: Name::root(),
                rtype: RR_TYPE_OPT,
                class: UDP_PAYLOAD_SIZE,
                ttl: 0,
                rdata: Vec::new(),
            }],
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn rcode(&self) -> u16 {
        self.flags & 0x000f
    }

    /// Serialize to wire format. Names are written without compression.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.questions.len() as u16);
        buf.put_u16(self.answers.len() as u16);
        buf.put_u16(self.authority.len() as u16);
        buf.put_u16(self.additional.len() as u16);
        for q in &self.questions {
            q.name.write(&mut buf);
            buf.put_u16(q.qtype);
            buf.put_u16(q.qclass);
        }
        for rr in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            rr.name.write(&mut buf);
            buf.put_u16(rr.rtype);
            buf.put_u16(rr.class);
            buf.put_u32(rr.ttl);
            buf.put_u16(rr.rdata.len() as u16);
            buf.put_slice(&rr.rdata);
        }
        buf.to_vec()
    }

    /// Parse a message from wire format.
    pub fn from_wire(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(truncated("header"));
        }
        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        let ancount = u16::from_be_bytes([data[6], data[7]]);
        let nscount = u16::from_be_bytes([data[8], data[9]]);
        let arcount = u16::from_be_bytes([data[10], data[11]]);

        let mut pos = 12usize;
        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let name = read_name(data, &mut pos)?;
            let qtype = read_u16(data, &mut pos)?;
            let qclass = read_u16(data, &mut pos)?;
            questions.push(Question {
                name,
                qtype,
                qclass,
            });
        }
        let mut answers = Vec::with_capacity(ancount as usize);
        for _ in 0..ancount {
            answers.push(read_rr(data, &mut pos)?);
        }
        let mut authority = Vec::with_capacity(nscount as usize);
        for _ in 0..nscount {
            authority.push(read_rr(data, &mut pos)?);
        }
        let mut additional = Vec::with_capacity(arcount as usize);
        for _ in 0..arcount {
            additional.push(read_rr(data, &mut pos)?);
        }

        Ok(Message {
            id,
            flags,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

fn read_u16(data: &[u8], pos: &mut usize) -> Result<u16> {
    if *pos + 2 > data.len() {
        return Err(truncated("u16"));
    }
    let v = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
    *pos += 2;
    Ok(v)
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    if *pos + 4 > data.len() {
        return Err(truncated("u32"));
    }
    let v = u32::from_be_bytes([
        data[*pos],
        data[*pos + 1],
        data[*pos + 2],
        data[*pos + 3],
    ]);
    *pos += 4;
    Ok(v)
}

fn read_rr(data: &[u8], pos: &mut usize) -> Result<ResourceRecord> {
    let name = read_name(data, pos)?;
    let rtype = read_u16(data, pos)?;
    let class = read_u16(data, pos)?;
    let ttl = read_u32(data, pos)?;
    let rdlen = read_u16(data, pos)? as usize;
    if *pos + rdlen > data.len() {
        return Err(truncated("rdata"));
    }
    let rdata = data[*pos..*pos + rdlen].to_vec();
    *pos += rdlen;
    Ok(ResourceRecord {
        name,
        rtype,
        class,
        ttl,
        rdata,
    })
}

/// Read a possibly-compressed name starting at `*pos`. `*pos` is
/// advanced past the name as it appears in place; pointer targets do not
/// move it.
fn read_name(data: &[u8], pos: &mut usize) -> Result<Name> {
    let mut labels = Vec::new();
    let mut cursor = *pos;
    let mut jumped = false;
    let mut jumps = 0usize;
    loop {
        let len = *data.get(cursor).ok_or_else(|| truncated("name"))? as usize;
        if len == 0 {
            if !jumped {
                *pos = cursor + 1;
            }
            break;
        }
        match len & 0xc0 {
            0xc0 => {
                let lo = *data.get(cursor + 1).ok_or_else(|| truncated("pointer"))? as usize;
                let target = ((len & 0x3f) << 8) | lo;
                if target >= data.len() {
                    return Err(DnsError::Parse("pointer out of range".into()));
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(DnsError::Parse("compression pointer loop".into()));
                }
                if !jumped {
                    *pos = cursor + 2;
                    jumped = true;
                }
                cursor = target;
            }
            0x00 => {
                let end = cursor + 1 + len;
                if end > data.len() {
                    return Err(truncated("label"));
                }
                labels.push(data[cursor + 1..end].to_vec());
                cursor = end;
            }
            _ => return Err(DnsError::Parse("reserved label type".into())),
        }
    }
    Name::new(labels)
}

/// Pack a byte string into TXT RDATA: length-prefixed character-strings
/// of at most 255 bytes. An empty payload becomes a single empty string.
pub fn pack_txt(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return vec![0];
    }
    let mut out = Vec::with_capacity(data.len() + data.len() / 255 + 1);
    for chunk in data.chunks(255) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
    out
}

/// Concatenate all character-strings in TXT RDATA into one byte string.
pub fn unpack_txt(rdata: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(rdata.len());
    let mut pos = 0usize;
    while pos < rdata.len() {
        let len = rdata[pos] as usize;
        pos += 1;
        if pos + len > rdata.len() {
            return Err(truncated("TXT character-string"));
        }
        out.extend_from_slice(&rdata[pos..pos + len]);
        pos += len;
    }
    Ok(out)
}
