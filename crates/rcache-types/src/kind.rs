//! Partitions of the persistence key space.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of a persisted record. Backends keep one key space per kind and
/// the used-key journal is partitioned the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Packets of cached call descriptors.
    Descriptor,
    /// Sequence counter seeds.
    Seed,
    /// Call-stack snapshots.
    Stack,
    /// Packets of expected-value records.
    ExpectedValue,
}

impl RecordKind {
    pub const ALL: [Self; 4] = [
        Self::Descriptor,
        Self::Seed,
        Self::Stack,
        Self::ExpectedValue,
    ];

    /// Stable label used for directory names, table values and journal lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Descriptor => "cache",
            Self::Seed => "seeds",
            Self::Stack => "stacks",
            Self::ExpectedValue => "evs",
        }
    }

    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_round_trip() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(RecordKind::from_label("nope"), None);
    }
}
