//! Process-local backend, used when persistence is not wanted across runs
//! and by tests.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use rcache_error::Result;
use rcache_types::RecordKind;

use crate::backend::Backend;

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<(RecordKind, String), Vec<u8>>,
    used: BTreeSet<(RecordKind, String)>,
}

/// In-memory [`Backend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".to_owned()
    }

    fn put(&self, kind: RecordKind, key: &str, record: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .records
            .insert((kind, key.to_owned()), record.to_vec());
        Ok(())
    }

    fn get(&self, kind: RecordKind, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .lock()
            .records
            .get(&(kind, key.to_owned()))
            .cloned())
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .records
            .remove(&(kind, key.to_owned()))
            .is_some())
    }

    fn list_keys(&self, kind: RecordKind) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .records
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn mark_used(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.inner.lock().used.insert((kind, key.to_owned()));
        Ok(())
    }

    fn list_used(&self, kind: RecordKind) -> Result<BTreeSet<String>> {
        Ok(self
            .inner
            .lock()
            .used
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn reset_used(&self) -> Result<()> {
        self.inner.lock().used.clear();
        Ok(())
    }

    fn get_run(&self, kind: RecordKind, key_for: &dyn Fn(u32) -> String) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock();
        let mut records = Vec::new();
        for number in 0_u32.. {
            match inner.records.get(&(kind, key_for(number))) {
                Some(record) => records.push(record.clone()),
                None => break,
            }
        }
        Ok(records)
    }

    fn replace_run(
        &self,
        kind: RecordKind,
        key_for: &dyn Fn(u32) -> String,
        fresh: &[(String, Vec<u8>)],
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for number in 0_u32.. {
            if inner.records.remove(&(kind, key_for(number))).is_none() {
                break;
            }
            removed += 1;
        }
        for (key, record) in fresh {
            inner.records.insert((kind, key.clone()), record.clone());
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_separate_key_spaces() {
        let backend = MemoryBackend::new();
        backend.put(RecordKind::Seed, "k", b"seed").unwrap();
        backend.put(RecordKind::Stack, "k", b"stack").unwrap();
        assert_eq!(
            backend.get(RecordKind::Seed, "k").unwrap().as_deref(),
            Some(&b"seed"[..])
        );
        assert_eq!(backend.list_keys(RecordKind::Stack).unwrap(), vec!["k"]);
        assert!(backend.list_keys(RecordKind::Descriptor).unwrap().is_empty());
        assert!(backend.delete(RecordKind::Seed, "k").unwrap());
        assert!(!backend.delete(RecordKind::Seed, "k").unwrap());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_used_journal() {
        let backend = MemoryBackend::new();
        backend.mark_used(RecordKind::Descriptor, "a").unwrap();
        backend.mark_used(RecordKind::Descriptor, "a").unwrap();
        backend.mark_used(RecordKind::Seed, "b").unwrap();
        assert_eq!(backend.list_used(RecordKind::Descriptor).unwrap().len(), 1);
        backend.reset_used().unwrap();
        assert!(backend.list_used(RecordKind::Seed).unwrap().is_empty());
    }
}
