//! Call stacks and hooks.
//!
//! A [`CallStack`] records, for one test, the ordered fingerprints of the
//! cached calls it made. A [`Hook`] attached to a fingerprint runs its
//! callback each time that fingerprint is added to the stack, unless a
//! pending skip (see [`CallStack::skip_once`]) suppresses that occurrence.
//! Stacks are persisted once per test and loaded on later runs, so hooks
//! registered while recording fire when the same calls are replayed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rcache_error::{RcacheError, Result};
use rcache_store::ChunkedStore;
use rcache_types::{CallDescriptor, Fingerprint, Kwargs, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Callback run when a hooked fingerprint is added to a stack.
pub type HookFn = Arc<dyn Fn(&CallDescriptor, &Hook) -> Result<()> + Send + Sync>;

/// Identity of one test's call stack: the module and the test handle.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StackKey {
    pub module: String,
    pub handle: String,
}

impl StackKey {
    #[must_use]
    pub fn new(module: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            handle: handle.into(),
        }
    }

    /// Key the stack is persisted under.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}.{}", self.module, self.handle)
    }
}

impl fmt::Display for StackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.handle)
    }
}

/// A callback bound to a fingerprint, with the arguments to call it with.
///
/// Only the callback's name is persisted; the function itself is
/// registered on the stack at runtime with [`CallStack::register_callback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub fingerprint: Fingerprint,
    pub callback: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl Hook {
    #[must_use]
    pub fn new(fingerprint: Fingerprint, callback: impl Into<String>) -> Self {
        Self {
            fingerprint,
            callback: callback.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, args: Vec<Value>, kwargs: Kwargs) -> Self {
        self.args = args;
        self.kwargs = kwargs;
        self
    }
}

/// Ordered record of the cached calls made by one test.
#[derive(Default, Serialize, Deserialize)]
pub struct CallStack {
    key: StackKey,
    calls: Vec<Fingerprint>,
    hooks: BTreeMap<Fingerprint, Vec<Hook>>,
    skips: BTreeMap<Fingerprint, u32>,
    #[serde(skip)]
    callbacks: HashMap<String, HookFn>,
}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut callbacks: Vec<&str> = self.callbacks.keys().map(String::as_str).collect();
        callbacks.sort_unstable();
        f.debug_struct("CallStack")
            .field("key", &self.key)
            .field("calls", &self.calls)
            .field("hooks", &self.hooks)
            .field("skips", &self.skips)
            .field("callbacks", &callbacks)
            .finish()
    }
}

impl CallStack {
    #[must_use]
    pub fn new(key: StackKey) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn key(&self) -> &StackKey {
        &self.key
    }

    #[must_use]
    pub fn calls(&self) -> &[Fingerprint] {
        &self.calls
    }

    #[must_use]
    pub fn hooks_for(&self, fingerprint: &Fingerprint) -> &[Hook] {
        self.hooks.get(fingerprint).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn pending_skips(&self, fingerprint: &Fingerprint) -> u32 {
        self.skips.get(fingerprint).copied().unwrap_or(0)
    }

    /// Make `callback` available to hooks naming it.
    pub fn register_callback(&mut self, name: impl Into<String>, callback: HookFn) {
        self.callbacks.insert(name.into(), callback);
    }

    pub fn add_hook(&mut self, hook: Hook) {
        debug!(
            stack = %self.key,
            fingerprint = hook.fingerprint.short(),
            callback = %hook.callback,
            "hook registered"
        );
        self.hooks
            .entry(hook.fingerprint.clone())
            .or_default()
            .push(hook);
    }

    /// Suppress hooks on the next occurrence of `fingerprint`.
    pub fn skip_once(&mut self, fingerprint: &Fingerprint) {
        *self.skips.entry(fingerprint.clone()).or_insert(0) += 1;
    }

    /// Append `descriptor` and run the hooks due for it.
    pub fn add(&mut self, descriptor: &CallDescriptor) -> Result<()> {
        for (hook, callback) in self.record(descriptor)? {
            callback(descriptor, &hook)?;
        }
        Ok(())
    }

    /// Append `descriptor` and return the hooks due, with their callbacks,
    /// without running them.
    fn record(&mut self, descriptor: &CallDescriptor) -> Result<Vec<(Hook, HookFn)>> {
        let fingerprint = &descriptor.fingerprint;
        self.calls.push(fingerprint.clone());

        if let Some(pending) = self.skips.get_mut(fingerprint).filter(|n| **n > 0) {
            *pending -= 1;
            debug!(stack = %self.key, fingerprint = fingerprint.short(), "hook skipped once");
            return Ok(Vec::new());
        }

        let mut due = Vec::new();
        for hook in self.hooks_for(fingerprint) {
            let callback = self.callbacks.get(&hook.callback).ok_or_else(|| {
                RcacheError::UnknownTarget {
                    target: hook.callback.clone(),
                }
            })?;
            due.push((hook.clone(), Arc::clone(callback)));
        }
        Ok(due)
    }

    /// Load the stack stored for `key`, if any.
    pub fn load(store: &ChunkedStore, key: &StackKey) -> Result<Option<Self>> {
        let storage_key = key.storage_key();
        let Some(bytes) = store.fetch(&storage_key)? else {
            return Ok(None);
        };
        let stack: Self = serde_json::from_slice(&bytes)
            .map_err(|err| RcacheError::corrupt(&storage_key, format!("call stack: {err}")))?;
        debug!(stack = %key, calls = stack.calls.len(), "call stack loaded");
        Ok(Some(stack))
    }

    /// Persist the stack unless one is already stored under its key.
    ///
    /// Returns whether anything was written. Re-recording requires
    /// [`CallStack::delete`] first.
    pub fn save(&self, store: &ChunkedStore) -> Result<bool> {
        let storage_key = self.key.storage_key();
        if store.contains(&storage_key)? {
            debug!(stack = %self.key, "call stack already stored");
            return Ok(false);
        }
        let bytes = serde_json::to_vec(self)
            .map_err(|err| RcacheError::unserializable(format!("call stack {}", self.key), err.to_string()))?;
        store.save(&storage_key, &bytes)?;
        info!(
            stack = %self.key,
            calls = self.calls.len(),
            hooks = self.hooks.values().map(Vec::len).sum::<usize>(),
            "call stack saved"
        );
        Ok(true)
    }

    /// Remove the stored stack for `key`. Returns whether one existed.
    pub fn delete(store: &ChunkedStore, key: &StackKey) -> Result<bool> {
        Ok(store.delete(&key.storage_key())? > 0)
    }
}

/// A [`CallStack`] shared between a context and the cached calls made
/// under it.
///
/// Hooks run after the lock is released, so a callback may itself make
/// cached calls against the same stack.
#[derive(Clone, Default)]
pub struct SharedCallStack(Arc<Mutex<CallStack>>);

impl fmt::Debug for SharedCallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedCallStack").field(&*self.0.lock()).finish()
    }
}

impl From<CallStack> for SharedCallStack {
    fn from(stack: CallStack) -> Self {
        Self(Arc::new(Mutex::new(stack)))
    }
}

impl SharedCallStack {
    #[must_use]
    pub fn new(key: StackKey) -> Self {
        CallStack::new(key).into()
    }

    /// Direct access, for inspection and persistence.
    pub fn lock(&self) -> MutexGuard<'_, CallStack> {
        self.0.lock()
    }

    pub fn add(&self, descriptor: &CallDescriptor) -> Result<()> {
        let due = self.0.lock().record(descriptor)?;
        for (hook, callback) in due {
            callback(descriptor, &hook)?;
        }
        Ok(())
    }

    pub fn add_hook(&self, hook: Hook) {
        self.0.lock().add_hook(hook);
    }

    pub fn skip_once(&self, fingerprint: &Fingerprint) {
        self.0.lock().skip_once(fingerprint);
    }

    pub fn register_callback(&self, name: impl Into<String>, callback: HookFn) {
        self.0.lock().register_callback(name, callback);
    }

    #[must_use]
    pub fn key(&self) -> StackKey {
        self.0.lock().key.clone()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<Fingerprint> {
        self.0.lock().calls.clone()
    }
}
