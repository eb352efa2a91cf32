//! Persistence backend contract.
//!
//! The cache needs four record operations (put, get, delete, list) plus a
//! journal of keys used since the last checkpoint, which drives the purge
//! sweep. Records are opaque byte strings partitioned by [`RecordKind`].

use std::collections::BTreeSet;

use rcache_error::Result;
use rcache_types::RecordKind;

/// A key/value store holding cache records.
///
/// Implementations must serialize writers across processes (lock file or
/// transaction) and make readers wait, not fail, while a write is in
/// flight. "Not found" is `Ok(None)`; an unreachable store is an `Err`.
pub trait Backend: Send + Sync {
    /// Short human-readable identity for log lines.
    fn describe(&self) -> String;

    /// Insert or overwrite a record.
    fn put(&self, kind: RecordKind, key: &str, record: &[u8]) -> Result<()>;

    fn get(&self, kind: RecordKind, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, kind: RecordKind, key: &str) -> Result<bool>;

    /// All keys of one kind, sorted.
    fn list_keys(&self, kind: RecordKind) -> Result<Vec<String>>;

    /// Journal a key as used since the last [`Backend::reset_used`].
    fn mark_used(&self, kind: RecordKind, key: &str) -> Result<()>;

    fn list_used(&self, kind: RecordKind) -> Result<BTreeSet<String>>;

    /// Clear the used-key journal.
    fn reset_used(&self) -> Result<()>;

    fn contains(&self, kind: RecordKind, key: &str) -> Result<bool> {
        Ok(self.get(kind, key)?.is_some())
    }

    /// Journal several keys at once.
    fn mark_used_all(&self, kind: RecordKind, keys: &[String]) -> Result<()> {
        for key in keys {
            self.mark_used(kind, key)?;
        }
        Ok(())
    }

    /// Read the run `key_for(0)`, `key_for(1)`, ... up to the first absent
    /// key, as one consistent snapshot.
    ///
    /// The default implementation reads record by record and is only as
    /// consistent as [`Backend::get`]; backends override it to hold their
    /// read lock or transaction across the whole run.
    fn get_run(&self, kind: RecordKind, key_for: &dyn Fn(u32) -> String) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        for number in 0_u32.. {
            match self.get(kind, &key_for(number))? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok(records)
    }

    /// Delete the run `key_for(0)`, `key_for(1)`, ... up to the first absent
    /// key, then write `fresh` records, as one unit.
    ///
    /// The run is discovered under the same lock or transaction that
    /// performs the writes. Returns the number of records deleted.
    fn replace_run(
        &self,
        kind: RecordKind,
        key_for: &dyn Fn(u32) -> String,
        fresh: &[(String, Vec<u8>)],
    ) -> Result<usize> {
        let mut removed = 0;
        for number in 0_u32.. {
            if !self.delete(kind, &key_for(number))? {
                break;
            }
            removed += 1;
        }
        for (key, record) in fresh {
            self.put(kind, key, record)?;
        }
        Ok(removed)
    }
}
