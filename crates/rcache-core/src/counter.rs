//! Per-call-site ordinals backed by persisted sequence seeds.
//!
//! The first time a signature is seen in a process its [`SequenceEntry`] is
//! loaded (or created at ordinal 0 with a freshly drawn random seed) and
//! the ordinal is then advanced in memory. Repeated identical calls from one
//! site therefore get distinct, run-to-run stable ordinals. Concurrent
//! recorders in different processes are not coordinated: the last seed
//! written wins.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rcache_error::{RcacheError, Result};
use rcache_store::Backend;
use rcache_types::{Fingerprint, RecordKind, SequenceEntry, SequenceSeed};
use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Slot {
    next: u64,
    seed: SequenceSeed,
}

/// Process-local ordinal source for call-site signatures.
pub struct SequenceCounter {
    backend: Arc<dyn Backend>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for SequenceCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceCounter")
            .field("backend", &self.backend.describe())
            .field("signatures", &self.slots.lock().len())
            .finish()
    }
}

impl SequenceCounter {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Storage key of the seed for `signature`.
    #[must_use]
    pub fn signature_hash(signature: &str) -> String {
        Fingerprint::from_digest(Sha256::digest(signature.as_bytes()).as_slice()).to_string()
    }

    /// The ordinal for this call from `signature`; the next call gets one more.
    pub fn next_ordinal(&self, signature: &str) -> Result<u64> {
        Ok(self.advance(signature)?.0)
    }

    /// A deterministic value in `[0, 1)` for this call from `signature`.
    ///
    /// Derived from the signature's persisted random seed and the ordinal,
    /// so a replayed run draws the same sequence as the recorded one.
    pub fn next_random(&self, signature: &str) -> Result<f64> {
        let (ordinal, seed) = self.advance(signature)?;
        let mut hasher = Sha256::new();
        hasher.update(seed.random_seed.to_le_bytes());
        hasher.update(ordinal.to_le_bytes());
        let digest = hasher.finalize();
        let mut word = [0_u8; 8];
        word.copy_from_slice(&digest[..8]);
        let bits = u64::from_le_bytes(word) >> 11;
        Ok(bits as f64 / (1_u64 << 53) as f64)
    }

    /// Drop the in-memory ordinals, as if the process had restarted.
    pub fn reset(&self) {
        self.slots.lock().clear();
    }

    fn advance(&self, signature: &str) -> Result<(u64, SequenceSeed)> {
        let key = Self::signature_hash(signature);
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&key) {
            let ordinal = slot.next;
            slot.next += 1;
            return Ok((ordinal, slot.seed));
        }
        let seed = match self.load_seed(&key)? {
            Some(seed) => seed,
            None => self.create_seed(&key)?,
        };
        self.backend.mark_used(RecordKind::Seed, &key)?;
        slots.insert(
            key,
            Slot {
                next: seed.sequence_value + 1,
                seed,
            },
        );
        Ok((seed.sequence_value, seed))
    }

    fn load_seed(&self, key: &str) -> Result<Option<SequenceSeed>> {
        let Some(bytes) = self.backend.get(RecordKind::Seed, key)? else {
            return Ok(None);
        };
        let entry: SequenceEntry = serde_json::from_slice(&bytes)
            .map_err(|err| RcacheError::corrupt(key, format!("sequence entry: {err}")))?;
        Ok(Some(entry.seed))
    }

    fn create_seed(&self, key: &str) -> Result<SequenceSeed> {
        let entry = SequenceEntry {
            signature_hash: key.to_owned(),
            seed: SequenceSeed {
                random_seed: rand::random(),
                sequence_value: 0,
            },
        };
        let body = serde_json::to_vec(&entry)
            .map_err(|err| RcacheError::unserializable("sequence entry", err.to_string()))?;
        self.backend.put(RecordKind::Seed, key, &body)?;
        debug!(signature_hash = key, "sequence seed created");
        Ok(entry.seed)
    }
}
