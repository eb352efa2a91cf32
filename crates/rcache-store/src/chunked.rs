//! Chunked persistence of payloads larger than a backend's record limit.
//!
//! A payload stored under an owner key is split into packets of at most
//! `max_packet_size` encoded bytes, stored as `<owner>#<n>`. Saving removes
//! every existing packet of the owner and writes the new ones under one
//! backend lock or transaction, and fetching reads the whole run under one
//! as well, so a payload is replaced and read as a unit. Reassembly fails
//! with [`RcacheError::Corrupt`] on a missing, misnumbered or foreign packet,
//! or on packets from different saves.

use std::sync::Arc;

use rcache_error::{RcacheError, Result};
use rcache_types::RecordKind;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::backend::Backend;
use crate::packet::{Packet, usize_to_u32};

/// Default bound on one stored packet, framing included.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

const PACKET_SEPARATOR: char = '#';

/// Packet-splitting view over one [`RecordKind`] of a backend.
#[derive(Clone)]
pub struct ChunkedStore {
    backend: Arc<dyn Backend>,
    kind: RecordKind,
    max_packet_size: usize,
}

impl std::fmt::Debug for ChunkedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedStore")
            .field("backend", &self.backend.describe())
            .field("kind", &self.kind)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

impl ChunkedStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, kind: RecordKind, max_packet_size: usize) -> Self {
        Self {
            backend,
            kind,
            max_packet_size,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Storage key of packet `number` of `owner`.
    #[must_use]
    pub fn packet_key(owner: &str, number: u32) -> String {
        format!("{owner}{PACKET_SEPARATOR}{number}")
    }

    /// Replace whatever is stored under `owner` with `payload`.
    ///
    /// Returns the number of packets written. An empty payload is stored as
    /// a single empty packet so it can be told apart from an absent owner.
    pub fn save(&self, owner: &str, payload: &[u8]) -> Result<usize> {
        let chunk_size = self
            .max_packet_size
            .saturating_sub(Packet::overhead(owner))
            .max(1);
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[][..]]
        } else {
            payload.chunks(chunk_size).collect()
        };
        let packet_count = usize_to_u32(chunks.len(), "packet count")?;
        let record_digest = xxh3_64(payload);

        let mut fresh = Vec::with_capacity(chunks.len());
        for (number, chunk) in (0_u32..).zip(&chunks) {
            let packet = Packet {
                owner: owner.to_owned(),
                packet_number: number,
                packet_count,
                record_digest,
                payload: chunk.to_vec(),
            };
            fresh.push((Self::packet_key(owner, number), packet.encode()?));
        }

        let key_for = |number: u32| Self::packet_key(owner, number);
        let removed = self.backend.replace_run(self.kind, &key_for, &fresh)?;
        let keys: Vec<String> = fresh.iter().map(|(key, _)| key.clone()).collect();
        self.backend.mark_used_all(self.kind, &keys)?;
        debug!(
            kind = %self.kind,
            owner,
            packets = fresh.len(),
            replaced = removed,
            bytes = payload.len(),
            "payload saved"
        );
        Ok(fresh.len())
    }

    /// Reassemble the payload stored under `owner`, or `None` if absent.
    /// Every packet read is journaled as used.
    pub fn fetch(&self, owner: &str) -> Result<Option<Vec<u8>>> {
        self.read(owner, true)
    }

    /// Like [`ChunkedStore::fetch`] but leaves the used-key journal alone,
    /// for sweeps that inspect records without keeping them alive.
    pub fn peek(&self, owner: &str) -> Result<Option<Vec<u8>>> {
        self.read(owner, false)
    }

    /// Whether a first packet is stored for `owner`.
    pub fn contains(&self, owner: &str) -> Result<bool> {
        self.backend.contains(self.kind, &Self::packet_key(owner, 0))
    }

    fn read(&self, owner: &str, track: bool) -> Result<Option<Vec<u8>>> {
        let key_for = |number: u32| Self::packet_key(owner, number);
        let records = self.backend.get_run(self.kind, &key_for)?;
        let Some(first_bytes) = records.first() else {
            return Ok(None);
        };
        let first_key = Self::packet_key(owner, 0);
        let first = Packet::decode(first_bytes, &first_key)?;
        check_packet(&first, owner, 0, &first, &first_key)?;
        let count = u32_to_usize(first.packet_count);
        if records.len() < count {
            return Err(RcacheError::corrupt(
                owner,
                format!("packet {} of {count} is missing", records.len()),
            ));
        }

        let mut keys = vec![first_key];
        let mut payload = first.payload.clone();
        for (number, bytes) in (1_u32..).zip(&records[1..count]) {
            let key = Self::packet_key(owner, number);
            let packet = Packet::decode(bytes, &key)?;
            check_packet(&packet, owner, number, &first, &key)?;
            payload.extend_from_slice(&packet.payload);
            keys.push(key);
        }
        if xxh3_64(&payload) != first.record_digest {
            return Err(RcacheError::corrupt(
                owner,
                "reassembled payload does not match its record digest",
            ));
        }
        if track {
            self.backend.mark_used_all(self.kind, &keys)?;
        }
        Ok(Some(payload))
    }

    /// Remove every packet of `owner`. Returns how many were removed.
    pub fn delete(&self, owner: &str) -> Result<usize> {
        let key_for = |number: u32| Self::packet_key(owner, number);
        let removed = self.backend.replace_run(self.kind, &key_for, &[])?;
        if removed > 0 {
            debug!(kind = %self.kind, owner, packets = removed, "payload deleted");
        }
        Ok(removed)
    }

    /// Owners with at least a first packet stored, sorted.
    pub fn owners(&self) -> Result<Vec<String>> {
        let suffix = format!("{PACKET_SEPARATOR}0");
        Ok(self
            .backend
            .list_keys(self.kind)?
            .into_iter()
            .filter_map(|key| key.strip_suffix(&suffix).map(str::to_owned))
            .collect())
    }
}

fn check_packet(
    packet: &Packet,
    owner: &str,
    expected_number: u32,
    first: &Packet,
    key: &str,
) -> Result<()> {
    if packet.owner != owner {
        return Err(RcacheError::corrupt(
            key,
            format!("packet belongs to `{}`", packet.owner),
        ));
    }
    if packet.packet_number != expected_number {
        return Err(RcacheError::corrupt(
            key,
            format!(
                "packets out of order: expected number {expected_number}, found {}",
                packet.packet_number
            ),
        ));
    }
    if packet.packet_count != first.packet_count {
        return Err(RcacheError::corrupt(
            key,
            format!(
                "packet count changed mid-record: expected {}, found {}",
                first.packet_count, packet.packet_count
            ),
        ));
    }
    if packet.record_digest != first.record_digest {
        return Err(RcacheError::corrupt(
            key,
            format!(
                "packet from a different save: record digest {:#018X}, expected {:#018X}",
                packet.record_digest, first.record_digest
            ),
        ));
    }
    Ok(())
}

fn u32_to_usize(value: u32) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}
