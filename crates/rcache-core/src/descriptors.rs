//! Persistence of [`CallDescriptor`]s.
//!
//! A descriptor is encoded as a versioned JSON body and stored through the
//! chunked packet protocol under its fingerprint. Saving replaces any
//! previous descriptor with the same fingerprint as a unit.

use std::sync::Arc;

use rcache_error::{RcacheError, Result};
use rcache_store::{Backend, ChunkedStore};
use rcache_types::{CallDescriptor, Fingerprint, Kwargs, RecordKind, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::normalize::normalize;

/// Version of the descriptor body encoding.
pub const DESCRIPTOR_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DescriptorBody {
    version: u32,
    fingerprint: Fingerprint,
    stack: String,
    method: String,
    args: Vec<Value>,
    kwargs: Kwargs,
    returnval: Value,
}

/// Store of recorded calls, keyed by fingerprint.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    packets: ChunkedStore,
}

impl DescriptorStore {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, max_packet_size: usize) -> Self {
        Self {
            packets: ChunkedStore::new(backend, RecordKind::Descriptor, max_packet_size),
        }
    }

    /// Persist `descriptor`, replacing any earlier one with its fingerprint.
    ///
    /// Fails with [`RcacheError::Unserializable`] when the return value
    /// cannot be replayed. Arguments are informational only: any that
    /// cannot be persisted are stored as their normalized text instead.
    pub fn save(&self, descriptor: &CallDescriptor) -> Result<()> {
        descriptor.return_value.check_persistable().map_err(|detail| {
            RcacheError::unserializable(
                format!("return value of `{}`", descriptor.method_name),
                detail,
            )
        })?;
        let body = DescriptorBody {
            version: DESCRIPTOR_FORMAT_VERSION,
            fingerprint: descriptor.fingerprint.clone(),
            stack: descriptor.call_site_signature.clone(),
            method: descriptor.method_name.clone(),
            args: descriptor.arguments.iter().map(persistable_or_text).collect(),
            kwargs: descriptor
                .keyword_arguments
                .iter()
                .map(|(k, v)| (k.clone(), persistable_or_text(v)))
                .collect(),
            returnval: descriptor.return_value.clone(),
        };
        let bytes = serde_json::to_vec(&body).map_err(|err| {
            RcacheError::unserializable(
                format!("descriptor for `{}`", descriptor.method_name),
                err.to_string(),
            )
        })?;
        let packets = self
            .packets
            .save(descriptor.fingerprint.as_str(), &bytes)?;
        debug!(
            fingerprint = descriptor.fingerprint.short(),
            method = %descriptor.method_name,
            packets,
            "descriptor saved"
        );
        Ok(())
    }

    /// Load the descriptor for `fingerprint`, or `None` if none is stored.
    pub fn fetch(&self, fingerprint: &Fingerprint) -> Result<Option<CallDescriptor>> {
        self.packets
            .fetch(fingerprint.as_str())?
            .map(|bytes| decode(fingerprint, &bytes))
            .transpose()
    }

    /// Remove the descriptor for `fingerprint`. Returns the packets removed.
    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<usize> {
        self.packets.delete(fingerprint.as_str())
    }

    /// Every stored fingerprint, sorted.
    pub fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let mut out = Vec::new();
        for owner in self.packets.owners()? {
            match Fingerprint::parse(&owner) {
                Some(fp) => out.push(fp),
                None => warn!(owner, "ignoring descriptor stored under a non-fingerprint key"),
            }
        }
        Ok(out)
    }

    /// Drop every stored descriptor so the next run records afresh.
    /// Returns the number of descriptors removed.
    pub fn recache_all(&self) -> Result<usize> {
        let mut removed = 0;
        for owner in self.packets.owners()? {
            if self.packets.delete(&owner)? > 0 {
                removed += 1;
            }
        }
        info!(removed, "all descriptors dropped for recache");
        Ok(removed)
    }

    /// Drop the descriptors for which `predicate` holds, e.g. every call
    /// recorded under one call-site signature. Returns how many were dropped.
    pub fn invalidate_where<P>(&self, predicate: P) -> Result<usize>
    where
        P: Fn(&CallDescriptor) -> bool,
    {
        let mut removed = 0;
        for fingerprint in self.fingerprints()? {
            let Some(bytes) = self.packets.peek(fingerprint.as_str())? else {
                continue;
            };
            let descriptor = decode(&fingerprint, &bytes)?;
            if predicate(&descriptor) {
                self.packets.delete(fingerprint.as_str())?;
                removed += 1;
            }
        }
        info!(removed, "descriptors invalidated");
        Ok(removed)
    }
}

fn persistable_or_text(value: &Value) -> Value {
    match value.check_persistable() {
        Ok(()) => value.clone(),
        Err(_) => Value::Str(normalize(value, 0)),
    }
}

fn decode(fingerprint: &Fingerprint, bytes: &[u8]) -> Result<CallDescriptor> {
    let body: DescriptorBody = serde_json::from_slice(bytes)
        .map_err(|err| RcacheError::corrupt(fingerprint.as_str(), format!("descriptor body: {err}")))?;
    if body.version != DESCRIPTOR_FORMAT_VERSION {
        return Err(RcacheError::corrupt(
            fingerprint.as_str(),
            format!(
                "unsupported descriptor version {}, expected {DESCRIPTOR_FORMAT_VERSION}",
                body.version
            ),
        ));
    }
    if body.fingerprint != *fingerprint {
        return Err(RcacheError::corrupt(
            fingerprint.as_str(),
            format!("body belongs to {}", body.fingerprint),
        ));
    }
    Ok(CallDescriptor {
        fingerprint: body.fingerprint,
        call_site_signature: body.stack,
        method_name: body.method,
        arguments: body.args,
        keyword_arguments: body.kwargs,
        return_value: body.returnval,
    })
}
