//! Sweep removing records not used since the last checkpoint.

use std::collections::BTreeMap;

use rcache_error::Result;
use rcache_types::RecordKind;
use tracing::{debug, info};

use crate::backend::Backend;

/// Outcome of [`purge_unused`], per record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: BTreeMap<RecordKind, usize>,
    pub kept: BTreeMap<RecordKind, usize>,
}

impl PurgeReport {
    #[must_use]
    pub fn total_removed(&self) -> usize {
        self.removed.values().sum()
    }
}

/// Delete every record whose key was not journaled as used since the last
/// [`Backend::reset_used`], then reset the journal.
///
/// Run this after a full test-suite pass: whatever the suite no longer
/// touches is stale.
pub fn purge_unused(backend: &dyn Backend) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();
    for kind in RecordKind::ALL {
        let used = backend.list_used(kind)?;
        let mut removed = 0;
        let mut kept = 0;
        for key in backend.list_keys(kind)? {
            if used.contains(&key) {
                kept += 1;
            } else if backend.delete(kind, &key)? {
                debug!(%kind, key, "purged unused record");
                removed += 1;
            }
        }
        report.removed.insert(kind, removed);
        report.kept.insert(kind, kept);
    }
    backend.reset_used()?;
    info!(
        backend = %backend.describe(),
        removed = report.total_removed(),
        "purged unused cache records"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[test]
    fn test_purge_keeps_only_used_keys() {
        let backend = MemoryBackend::new();
        backend.put(RecordKind::Descriptor, "live#0", b"x").unwrap();
        backend.put(RecordKind::Descriptor, "dead#0", b"x").unwrap();
        backend.put(RecordKind::Seed, "seed", b"x").unwrap();
        backend.mark_used(RecordKind::Descriptor, "live#0").unwrap();

        let report = purge_unused(&backend).unwrap();
        assert_eq!(report.removed[&RecordKind::Descriptor], 1);
        assert_eq!(report.removed[&RecordKind::Seed], 1);
        assert_eq!(report.kept[&RecordKind::Descriptor], 1);
        assert_eq!(report.total_removed(), 2);
        assert_eq!(
            backend.list_keys(RecordKind::Descriptor).unwrap(),
            vec!["live#0"]
        );
        assert!(backend.list_used(RecordKind::Descriptor).unwrap().is_empty());
    }
}
