//! Argument masks excluding nondeterministic inputs from call identity.

use serde::{Deserialize, Serialize};

use crate::value::{Kwargs, Value};

/// Positional indices and keyword keys whose values do not take part in a
/// call's fingerprint.
///
/// Positions refer to the positional argument slice exactly as passed;
/// indices beyond its end are ignored. Masked keyword keys are set to
/// [`Value::Null`] whether or not the call supplied them, so a call that
/// omits a masked keyword fingerprints like one that passes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreMask {
    pub positions: Vec<usize>,
    pub keys: Vec<String>,
}

impl IgnoreMask {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn positions(mut self, positions: impl IntoIterator<Item = usize>) -> Self {
        self.positions.extend(positions);
        self
    }

    #[must_use]
    pub fn keys<K: Into<String>>(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.keys.is_empty()
    }

    /// Copies of `args` and `kwargs` with every masked slot nulled out.
    #[must_use]
    pub fn apply(&self, args: &[Value], kwargs: &Kwargs) -> (Vec<Value>, Kwargs) {
        let mut args = args.to_vec();
        for &idx in &self.positions {
            if let Some(slot) = args.get_mut(idx) {
                *slot = Value::Null;
            }
        }
        let mut kwargs = kwargs.clone();
        for key in &self.keys {
            kwargs.insert(key.clone(), Value::Null);
        }
        (args, kwargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::kwargs;

    #[test]
    fn test_apply_nulls_positions_and_keys() {
        let mask = IgnoreMask::new().positions([0, 1]).keys(["b"]);
        let (args, kw) = mask.apply(
            &[Value::Int(1), Value::Int(2), Value::Int(3)],
            &kwargs([("a", 1), ("b", 2)]),
        );
        assert_eq!(args, vec![Value::Null, Value::Null, Value::Int(3)]);
        assert_eq!(kw.get("a"), Some(&Value::Int(1)));
        assert_eq!(kw.get("b"), Some(&Value::Null));
    }

    #[test]
    fn test_out_of_range_position_is_ignored() {
        let mask = IgnoreMask::new().positions([7]);
        let (args, _) = mask.apply(&[Value::Int(1)], &Kwargs::new());
        assert_eq!(args, vec![Value::Int(1)]);
    }

    #[test]
    fn test_absent_masked_key_is_inserted_as_null() {
        let mask = IgnoreMask::new().keys(["stamp"]);
        let (_, kw) = mask.apply(&[], &Kwargs::new());
        assert_eq!(kw.get("stamp"), Some(&Value::Null));
        assert!(!mask.is_empty());
        assert!(IgnoreMask::new().is_empty());
    }
}
