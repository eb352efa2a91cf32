//! Record types persisted by the cache.

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::value::{Kwargs, Value};

/// One recorded invocation.
///
/// Created in memory when a cache miss triggers a real call and persisted
/// immediately. A persisted descriptor is never edited in place; replacing
/// it means deleting and re-inserting under the same fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDescriptor {
    pub fingerprint: Fingerprint,
    /// Serialized call path the fingerprint was derived from.
    pub call_site_signature: String,
    /// Display name of the invoked callable.
    pub method_name: String,
    /// Inputs, kept for diagnostics only.
    pub arguments: Vec<Value>,
    pub keyword_arguments: Kwargs,
    pub return_value: Value,
}

impl CallDescriptor {
    #[must_use]
    pub fn new(
        fingerprint: Fingerprint,
        call_site_signature: impl Into<String>,
        method_name: impl Into<String>,
        return_value: Value,
    ) -> Self {
        Self {
            fingerprint,
            call_site_signature: call_site_signature.into(),
            method_name: method_name.into(),
            arguments: Vec::new(),
            keyword_arguments: Kwargs::new(),
            return_value,
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: Vec<Value>, keyword_arguments: Kwargs) -> Self {
        self.arguments = arguments;
        self.keyword_arguments = keyword_arguments;
        self
    }
}

/// Persisted ordinal state for one call-site signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSeed {
    /// Seed for deterministic pseudo-random draws at this call site.
    pub random_seed: u64,
    /// First ordinal handed out in a fresh process.
    pub sequence_value: u64,
}

/// One row of the sequence table, keyed by the hash of a call-site signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub signature_hash: String,
    #[serde(flatten)]
    pub seed: SequenceSeed,
}
