//! Packing of tunnel packets into DNS queries and back out of DNS
//! responses.
//!
//! Upstream, a packet rides in the QNAME of a TXT query: the decoded
//! record is base32-encoded (RFC 4648 alphabet, no padding, lowercase),
//! split into labels of at most 63 bytes, and the tunnel suffix is
//! appended. Downstream, packets ride in the TXT RDATA of the single
//! answer record, as a sequence of `u16`-BE length-prefixed records.
//!
//! Decoded record layout:
//!
//! ```text
//! ClientID(8) || TypeByte(1) || Padding(n) || [ PayloadLen(1) || Payload ]
//! ```
//!
//! where `TypeByte = 224 + n` and `n` is 3 for data queries or 8 for
//! pure polls, so a poll query is indistinguishable by length from a
//! small data query.

use crate::dns::{self, Message, Name, MAX_LABEL_LEN};
use crate::{Error, Result};
use base32::Alphabet;
use rand::RngCore;
use std::fmt;

/// Bytes in a client identifier.
pub const CLIENT_ID_LEN: usize = 8;

/// Random padding bytes in a data query.
pub const NUM_PADDING: usize = 3;
/// Random padding bytes in a poll query.
pub const NUM_PADDING_POLL: usize = 8;

/// Payload lengths must stay below this; 224..=255 is the type-byte
/// marker space.
pub const MAX_PACKET_LEN: usize = 223;

const TYPE_BYTE_BASE: u8 = 224;

const BASE32: Alphabet = Alphabet::RFC4648 { padding: false };

/// Random 8-byte identifier prefixing every outbound record, letting the
/// authoritative server demultiplex concurrent clients behind one
/// resolver. Minted once per packet-conn lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    pub fn random() -> Self {
        let mut id = [0u8; CLIENT_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        ClientId(id)
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Upstream capacity in decoded bytes for names under `suffix`.
///
/// Starts from the 255-byte name limit minus the suffix, scales by 63/64
/// for the worst-case label-boundary bytes inserted into the flat base32
/// stream, and by 5/8 for base32 expansion.
pub fn name_capacity(suffix: &Name) -> usize {
    let mut capacity = dns::MAX_NAME_LEN - suffix.wire_len();
    capacity = capacity * 63 / 64;
    capacity = capacity * 5 / 8;
    capacity
}

/// Largest packet that fits in one query under `suffix`, after the
/// client ID, type byte, padding, and payload length prefix. Negative
/// when the suffix leaves no room at all.
pub fn effective_mtu(suffix: &Name) -> isize {
    name_capacity(suffix) as isize - (CLIENT_ID_LEN + 1 + NUM_PADDING + 1) as isize
}

/// Encode one outbound packet (possibly empty, for a poll) into the
/// QNAME of a query under `suffix`.
pub fn encode_packet(client_id: ClientId, packet: &[u8], suffix: &Name) -> Result<Name> {
    if packet.len() > MAX_PACKET_LEN {
        return Err(Error::PacketTooLong(packet.len()));
    }
    let num_padding = if packet.is_empty() {
        NUM_PADDING_POLL
    } else {
        NUM_PADDING
    };

    let mut decoded = Vec::with_capacity(CLIENT_ID_LEN + 2 + num_padding + packet.len());
    decoded.extend_from_slice(client_id.as_bytes());
    decoded.push(TYPE_BYTE_BASE + num_padding as u8);
    let mut padding = [0u8; NUM_PADDING_POLL];
    rand::thread_rng().fill_bytes(&mut padding[..num_padding]);
    decoded.extend_from_slice(&padding[..num_padding]);
    if !packet.is_empty() {
        decoded.push(packet.len() as u8);
        decoded.extend_from_slice(packet);
    }

    let encoded = base32::encode(BASE32, &decoded).to_ascii_lowercase();
    let mut labels: Vec<Vec<u8>> = encoded
        .as_bytes()
        .chunks(MAX_LABEL_LEN)
        .map(|c| c.to_vec())
        .collect();
    labels.extend(suffix.labels().iter().cloned());
    Ok(Name::new(labels)?)
}

/// Recover the decoded record from a query name produced by
/// [`encode_packet`]. This is the authoritative server's side of the
/// exchange; the client keeps it for loopback tests and fixtures.
pub fn decode_query(name: &Name, suffix: &Name) -> Option<(ClientId, Vec<u8>)> {
    if !name.ends_with(suffix) || name.labels().len() <= suffix.labels().len() {
        return None;
    }
    let data_labels = &name.labels()[..name.labels().len() - suffix.labels().len()];
    let mut encoded = Vec::new();
    for label in data_labels {
        encoded.extend_from_slice(label);
    }
    let encoded = String::from_utf8(encoded).ok()?.to_ascii_uppercase();
    let decoded = base32::decode(BASE32, &encoded)?;

    if decoded.len() < CLIENT_ID_LEN + 1 {
        return None;
    }
    let mut id = [0u8; CLIENT_ID_LEN];
    id.copy_from_slice(&decoded[..CLIENT_ID_LEN]);
    let type_byte = decoded[CLIENT_ID_LEN];
    let num_padding = type_byte.checked_sub(TYPE_BYTE_BASE)? as usize;
    let mut pos = CLIENT_ID_LEN + 1 + num_padding;
    if pos > decoded.len() {
        return None;
    }
    if pos == decoded.len() {
        // pure poll, no payload
        return Some((ClientId(id), Vec::new()));
    }
    let len = decoded[pos] as usize;
    pos += 1;
    if pos + len > decoded.len() {
        return None;
    }
    Some((ClientId(id), decoded[pos..pos + len].to_vec()))
}

/// Extract the downstream byte string from a response, applying the
/// acceptance rules: QR set, rcode NoError, exactly one answer, answer
/// name under the tunnel suffix, answer type TXT. Anything else is
/// silently dropped; a resolver in the path can synthesize almost any
/// other shape.
pub fn response_payload(resp: &Message, suffix: &Name) -> Option<Vec<u8>> {
    if !resp.is_response() || resp.rcode() != dns::RCODE_NO_ERROR {
        return None;
    }
    if resp.answers.len() != 1 {
        return None;
    }
    let answer = &resp.answers[0];
    if !answer.name.ends_with(suffix) || answer.rtype != dns::RR_TYPE_TXT {
        return None;
    }
    dns::unpack_txt(&answer.rdata).ok()
}

/// Split a downstream byte string into packets: a sequence of `u16`-BE
/// length-prefixed records. Parsing stops at the end of the buffer; a
/// truncated final record aborts the rest of this message only, keeping
/// the packets already recovered.
pub fn split_packets(payload: &[u8]) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut pos = 0usize;
    while pos + 2 <= payload.len() {
        let len = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
        pos += 2;
        if pos + len > payload.len() {
            log::debug!("truncated record in downstream payload, dropping remainder");
            break;
        }
        packets.push(payload[pos..pos + len].to_vec());
        pos += len;
    }
    packets
}

/// Join packets into a downstream byte string; the inverse of
/// [`split_packets`], used by fixtures standing in for the server.
pub fn join_packets(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in packets {
        out.extend_from_slice(&(p.len() as u16).to_be_bytes());
        out.extend_from_slice(p);
    }
    out
}
