//! Wire format of one stored packet.
//!
//! Large payloads are split into bounded packets before they reach a
//! backend (see [`crate::chunked`]). Each packet is self-describing so a
//! fetch can prove it reassembled the right pieces in the right order, all
//! from the same save.
//!
//! Layout (little-endian integer fields):
//! - `magic[4]` (`"RCPK"`)
//! - `version: u32`
//! - `packet_number: u32`
//! - `packet_count: u32`
//! - `owner_len: u32`
//! - `payload_len: u32`
//! - `record_digest: u64` (xxh3 of the whole reassembled payload)
//! - `owner[owner_len]` (UTF-8 owner key, e.g. a fingerprint)
//! - `payload[payload_len]`
//! - `xxh3: u64` (hash of every preceding byte)

use rcache_error::{RcacheError, Result};
use xxhash_rust::xxh3::xxh3_64;

/// Magic bytes opening every packet (`"RCPK"`).
pub const PACKET_MAGIC: [u8; 4] = *b"RCPK";
/// Current packet format version.
pub const PACKET_VERSION: u32 = 2;
/// Fixed bytes before the owner key.
pub const PACKET_HEADER_BYTES: usize = 32;
const PACKET_TRAILER_BYTES: usize = 8;

/// One bounded slice of a chunked payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Key of the logical record this packet belongs to.
    pub owner: String,
    /// Zero-based position within the record.
    pub packet_number: u32,
    /// Total packets making up the record.
    pub packet_count: u32,
    /// xxh3 of the complete record payload. Identical in every packet of
    /// one save.
    pub record_digest: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Framing overhead for a packet owned by `owner`.
    #[must_use]
    pub const fn overhead(owner: &str) -> usize {
        PACKET_HEADER_BYTES + owner.len() + PACKET_TRAILER_BYTES
    }

    /// Encode to the exact stored representation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let owner_len = usize_to_u32(self.owner.len(), "owner length")?;
        let payload_len = usize_to_u32(self.payload.len(), "payload length")?;
        let mut out = Vec::with_capacity(Self::overhead(&self.owner) + self.payload.len());
        out.extend_from_slice(&PACKET_MAGIC);
        out.extend_from_slice(&PACKET_VERSION.to_le_bytes());
        out.extend_from_slice(&self.packet_number.to_le_bytes());
        out.extend_from_slice(&self.packet_count.to_le_bytes());
        out.extend_from_slice(&owner_len.to_le_bytes());
        out.extend_from_slice(&payload_len.to_le_bytes());
        out.extend_from_slice(&self.record_digest.to_le_bytes());
        out.extend_from_slice(self.owner.as_bytes());
        out.extend_from_slice(&self.payload);
        let checksum = xxh3_64(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        Ok(out)
    }

    /// Decode and validate a stored packet. `key` names the record in errors.
    pub fn decode(bytes: &[u8], key: &str) -> Result<Self> {
        if bytes.len() < PACKET_HEADER_BYTES + PACKET_TRAILER_BYTES {
            return Err(RcacheError::corrupt(
                key,
                format!(
                    "packet too short: expected at least {}, got {}",
                    PACKET_HEADER_BYTES + PACKET_TRAILER_BYTES,
                    bytes.len()
                ),
            ));
        }
        if bytes[0..4] != PACKET_MAGIC {
            return Err(RcacheError::corrupt(
                key,
                format!("invalid packet magic: {:02X?}", &bytes[0..4]),
            ));
        }
        let version = read_u32_at(bytes, 4, "version", key)?;
        if version != PACKET_VERSION {
            return Err(RcacheError::corrupt(
                key,
                format!("unsupported packet version {version}, expected {PACKET_VERSION}"),
            ));
        }
        let packet_number = read_u32_at(bytes, 8, "packet_number", key)?;
        let packet_count = read_u32_at(bytes, 12, "packet_count", key)?;
        let owner_len = u32_to_usize(read_u32_at(bytes, 16, "owner_len", key)?, key)?;
        let payload_len = u32_to_usize(read_u32_at(bytes, 20, "payload_len", key)?, key)?;
        let record_digest = read_u64_at(bytes, 24, "record_digest", key)?;

        let body_end = PACKET_HEADER_BYTES
            .checked_add(owner_len)
            .and_then(|n| n.checked_add(payload_len))
            .ok_or_else(|| RcacheError::corrupt(key, "packet lengths overflow"))?;
        if bytes.len() != body_end + PACKET_TRAILER_BYTES {
            return Err(RcacheError::corrupt(
                key,
                format!(
                    "packet length mismatch: header implies {}, got {}",
                    body_end + PACKET_TRAILER_BYTES,
                    bytes.len()
                ),
            ));
        }
        let stored = read_u64_at(bytes, body_end, "xxh3", key)?;
        let computed = xxh3_64(&bytes[..body_end]);
        if stored != computed {
            return Err(RcacheError::corrupt(
                key,
                format!("packet checksum mismatch: stored {stored:#018X}, computed {computed:#018X}"),
            ));
        }
        if packet_number >= packet_count {
            return Err(RcacheError::corrupt(
                key,
                format!("packet number {packet_number} outside count {packet_count}"),
            ));
        }

        let owner_end = PACKET_HEADER_BYTES + owner_len;
        let owner = std::str::from_utf8(&bytes[PACKET_HEADER_BYTES..owner_end])
            .map_err(|err| RcacheError::corrupt(key, format!("owner is not UTF-8: {err}")))?
            .to_owned();
        Ok(Self {
            owner,
            packet_number,
            packet_count,
            record_digest,
            payload: bytes[owner_end..body_end].to_vec(),
        })
    }
}

fn read_u32_at(bytes: &[u8], start: usize, field: &str, key: &str) -> Result<u32> {
    let array: [u8; 4] = bytes
        .get(start..start + 4)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| RcacheError::corrupt(key, format!("field {field} out of bounds")))?;
    Ok(u32::from_le_bytes(array))
}

fn read_u64_at(bytes: &[u8], start: usize, field: &str, key: &str) -> Result<u64> {
    let array: [u8; 8] = bytes
        .get(start..start + 8)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| RcacheError::corrupt(key, format!("field {field} out of bounds")))?;
    Ok(u64::from_le_bytes(array))
}

fn u32_to_usize(value: u32, key: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| RcacheError::corrupt(key, format!("{value} does not fit in usize")))
}

pub(crate) fn usize_to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| RcacheError::internal(format!("{what} does not fit in u32: {value}")))
}
