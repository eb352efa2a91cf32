//! Expected values: assertions against the value a test saw when it was
//! first recorded.
//!
//! The first run stores each observed value; later runs compare what they
//! observe against the stored one. Values are keyed by call site and an
//! ordinal of their own, so several expectations from one site stay apart.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use rcache_error::{RcacheError, Result};
use rcache_store::ChunkedStore;
use rcache_types::{Fingerprint, RecordKind, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::callsite::CallSite;
use crate::engine::Engine;

const EXPECTED_VALUE_CALLABLE: &str = "expected_value";

/// Store of expected values, borrowed from an [`Engine`].
pub struct ExpectedValues<'a> {
    engine: &'a Engine,
    store: ChunkedStore,
}

impl fmt::Debug for ExpectedValues<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectedValues")
            .field("enabled", &self.engine.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Expected values recorded through this engine.
    #[must_use]
    pub fn expected(&self) -> ExpectedValues<'_> {
        ExpectedValues {
            engine: self,
            store: ChunkedStore::new(
                Arc::clone(self.backend()),
                RecordKind::ExpectedValue,
                self.max_packet_size(),
            ),
        }
    }
}

impl ExpectedValues<'_> {
    /// The value stored for this expectation, storing `observed` if there
    /// is none yet. A disabled engine returns `observed`.
    pub fn get_or_store(&self, site: &CallSite, observed: &Value) -> Result<Value> {
        if !self.engine.is_enabled() {
            return Ok(observed.clone());
        }
        let signature = site.signature_for(EXPECTED_VALUE_CALLABLE);
        let ordinal = self
            .engine
            .counter()
            .next_ordinal(&format!("ev:{signature}"))?;
        let key = Fingerprint::from_digest(
            Sha256::digest(format!("{signature}.{ordinal}").as_bytes()).as_slice(),
        );

        if let Some(bytes) = self.store.fetch(key.as_str())? {
            let stored: Value = serde_json::from_slice(&bytes)
                .map_err(|err| RcacheError::corrupt(key.as_str(), format!("expected value: {err}")))?;
            return Ok(stored);
        }

        observed.check_persistable().map_err(|detail| {
            RcacheError::unserializable(format!("expected value at {signature}"), detail)
        })?;
        let body = serde_json::to_vec(observed)
            .map_err(|err| RcacheError::unserializable("expected value", err.to_string()))?;
        self.store.save(key.as_str(), &body)?;
        debug!(key = key.short(), ordinal, "expected value stored");
        Ok(observed.clone())
    }

    pub fn is_equal_to(&self, site: &CallSite, observed: &Value) -> Result<bool> {
        Ok(self.get_or_store(site, observed)? == *observed)
    }

    /// Whether the stored value is greater than `observed`. Values that do
    /// not order against each other compare as not greater.
    pub fn is_greater_than(&self, site: &CallSite, observed: &Value) -> Result<bool> {
        let stored = self.get_or_store(site, observed)?;
        Ok(compare(&stored, observed) == Some(Ordering::Greater))
    }

    pub fn is_less_than(&self, site: &CallSite, observed: &Value) -> Result<bool> {
        let stored = self.get_or_store(site, observed)?;
        Ok(compare(&stored, observed) == Some(Ordering::Less))
    }

    /// Whether the stored value contains `element`.
    pub fn contains(&self, site: &CallSite, observed: &Value, element: &Value) -> Result<bool> {
        Ok(self.get_or_store(site, observed)?.contains(element))
    }

    pub fn does_not_contain(&self, site: &CallSite, observed: &Value, element: &Value) -> Result<bool> {
        Ok(!self.get_or_store(site, observed)?.contains(element))
    }

    /// `predicate(stored, observed)`.
    pub fn is_true_under<P>(&self, site: &CallSite, observed: &Value, predicate: P) -> Result<bool>
    where
        P: FnOnce(&Value, &Value) -> bool,
    {
        let stored = self.get_or_store(site, observed)?;
        Ok(predicate(&stored, observed))
    }
}

/// Ordering between comparable values: numbers (ints and floats mixed),
/// strings, booleans, bytes, and sequences of those compared element-wise.
#[allow(clippy::cast_precision_loss)]
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        (Value::List(x), Value::List(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            for (left, right) in x.iter().zip(y) {
                match compare(left, right)? {
                    Ordering::Equal => {}
                    unequal => return Some(unequal),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use rcache_store::{Backend, DEFAULT_MAX_PACKET_SIZE, MemoryBackend};

    use super::*;

    fn engine(backend: &Arc<dyn Backend>) -> Engine {
        Engine::with_backend(Arc::clone(backend), true, DEFAULT_MAX_PACKET_SIZE)
    }

    #[test]
    fn test_first_run_stores_later_runs_compare() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let site = CallSite::suite("tests.ev", "test_totals");

        let first = engine(&backend);
        let evs = first.expected();
        assert!(evs.is_equal_to(&site, &Value::Int(42)).unwrap());
        assert!(evs.is_equal_to(&site, &Value::from("second")).unwrap());

        let second = engine(&backend);
        let evs = second.expected();
        assert!(evs.is_greater_than(&site, &Value::Int(41)).unwrap());
        assert!(!evs.is_equal_to(&site, &Value::from("changed")).unwrap());
        assert_eq!(backend.list_keys(RecordKind::ExpectedValue).unwrap().len(), 2);
    }

    #[test]
    fn test_membership_and_custom_predicates() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let site = CallSite::suite("tests.ev", "test_members");
        let observed = Value::list(["a", "b"]);

        let first = engine(&backend);
        let evs = first.expected();
        evs.get_or_store(&site, &observed).unwrap();
        evs.get_or_store(&site, &Value::Float(2.5)).unwrap();

        let second = engine(&backend);
        let evs = second.expected();
        assert!(evs.contains(&site, &Value::Null, &Value::from("a")).unwrap());
        assert!(evs.is_less_than(&site, &Value::Int(3)).unwrap());

        let third = engine(&backend);
        let evs = third.expected();
        assert!(evs.does_not_contain(&site, &Value::Null, &Value::from("z")).unwrap());
        let close = evs
            .is_true_under(&site, &Value::Float(2.4), |stored, seen| {
                match (stored, seen) {
                    (Value::Float(a), Value::Float(b)) => (a - b).abs() < 0.5,
                    _ => false,
                }
            })
            .unwrap();
        assert!(close);
    }

    #[test]
    fn test_disabled_engine_echoes_observation() {
        let engine = Engine::disabled();
        let evs = engine.expected();
        let site = CallSite::suite("tests.ev", "test_disabled");
        assert_eq!(
            evs.get_or_store(&site, &Value::Int(1)).unwrap(),
            Value::Int(1)
        );
        assert!(engine.backend().list_keys(RecordKind::ExpectedValue).unwrap().is_empty());
    }

    #[test]
    fn test_compare_mixes_numbers_only() {
        assert_eq!(compare(&Value::Int(2), &Value::Float(1.5)), Some(Ordering::Greater));
        assert_eq!(
            compare(&Value::list([1, 2]), &Value::list([1, 2, 0])),
            Some(Ordering::Less)
        );
        assert_eq!(compare(&Value::Int(1), &Value::from("1")), None);
    }
}
