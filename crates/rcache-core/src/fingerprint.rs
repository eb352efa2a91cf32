//! Call fingerprints.
//!
//! A fingerprint is the SHA-256 of
//! `normalized_args \n ordinal \n normalized_kwargs \n signature \n`, where
//! masked arguments have been nulled first and the ordinal comes from the
//! [`SequenceCounter`]. Replaying the same calls in the same order yields
//! the same fingerprints.

use rcache_error::Result;
use rcache_types::{Fingerprint, IgnoreMask, Kwargs, Value};
use sha2::{Digest, Sha256};

use crate::counter::SequenceCounter;
use crate::normalize::{normalize_args, normalize_kwargs};

/// Fingerprint one call, advancing the ordinal for `signature`.
pub fn fingerprint(
    counter: &SequenceCounter,
    args: &[Value],
    kwargs: &Kwargs,
    signature: &str,
    ignore: Option<&IgnoreMask>,
) -> Result<Fingerprint> {
    let ordinal = counter.next_ordinal(signature)?;
    Ok(digest(args, kwargs, signature, ordinal, ignore))
}

/// The pure part of [`fingerprint`]: hash inputs with an explicit ordinal.
#[must_use]
pub fn digest(
    args: &[Value],
    kwargs: &Kwargs,
    signature: &str,
    ordinal: u64,
    ignore: Option<&IgnoreMask>,
) -> Fingerprint {
    let (args_text, kwargs_text) = match ignore {
        Some(mask) if !mask.is_empty() => {
            let (args, kwargs) = mask.apply(args, kwargs);
            (normalize_args(&args), normalize_kwargs(&kwargs))
        }
        _ => (normalize_args(args), normalize_kwargs(kwargs)),
    };
    let mut hasher = Sha256::new();
    hasher.update(args_text.as_bytes());
    hasher.update(b"\n");
    hasher.update(ordinal.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(kwargs_text.as_bytes());
    hasher.update(b"\n");
    hasher.update(signature.as_bytes());
    hasher.update(b"\n");
    Fingerprint::from_digest(hasher.finalize().as_slice())
}
