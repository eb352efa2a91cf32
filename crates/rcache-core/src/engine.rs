//! The record/replay cache operation.
//!
//! [`Engine`] owns everything a run of cached calls needs: the backend, the
//! sequence counter, the descriptor and call-stack stores, and the open
//! contexts. It is passed explicitly to whatever intercepts calls; there is
//! no process-global state.
//!
//! A cached call is fingerprinted, looked up, and either replayed from the
//! stored descriptor or executed and recorded. Only successful calls are
//! recorded: an error from the wrapped callable propagates and nothing is
//! written.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rcache_error::{RcacheError, Result};
use rcache_store::{
    Backend, ChunkedStore, DEFAULT_MAX_PACKET_SIZE, MemoryBackend, PurgeReport,
};
use rcache_types::{CallDescriptor, Fingerprint, IgnoreMask, Kwargs, RecordKind, Value};
use tracing::{debug, info};

use crate::callsite::CallSite;
use crate::config::CacheConfig;
use crate::context::Context;
use crate::counter::SequenceCounter;
use crate::descriptors::DescriptorStore;
use crate::fingerprint::fingerprint;
use crate::hooks::{CallStack, Hook, HookFn, SharedCallStack, StackKey};

// ── Callables ────────────────────────────────────────────────────────

/// Something the cache can stand in front of.
///
/// The name takes part in the call-site signature, so two callables with
/// the same name called from the same site share fingerprints.
pub trait Callable: Send + Sync {
    fn name(&self) -> &str;
    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value>;
}

type CallFn = Arc<dyn Fn(&[Value], &Kwargs) -> Result<Value> + Send + Sync>;

/// A closure with a declared name.
#[derive(Clone)]
pub struct NamedFn {
    name: String,
    f: CallFn,
}

impl NamedFn {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for NamedFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NamedFn").field(&self.name).finish()
    }
}

impl Callable for NamedFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        (self.f)(args, kwargs)
    }
}

// ── Stubs and options ────────────────────────────────────────────────

/// What runs instead of the cache machinery.
#[derive(Clone)]
pub enum SideEffect {
    /// Call this instead, with the same arguments.
    Call(Arc<dyn Callable>),
    /// Fail with [`RcacheError::Raised`].
    Raise { name: String, message: String },
}

impl SideEffect {
    #[must_use]
    pub fn raise(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Raise {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn run(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        match self {
            Self::Call(callable) => callable.call(args, kwargs),
            Self::Raise { name, message } => Err(RcacheError::Raised {
                name: name.clone(),
                message: message.clone(),
            }),
        }
    }
}

impl fmt::Debug for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(callable) => f.debug_tuple("Call").field(&callable.name()).finish(),
            Self::Raise { name, message } => f
                .debug_struct("Raise")
                .field("name", name)
                .field("message", message)
                .finish(),
        }
    }
}

/// How a call is answered.
#[derive(Debug, Clone, Default)]
pub enum Stub {
    /// Record on a miss, replay on a hit.
    #[default]
    Cache,
    /// Return this value; nothing is fingerprinted or stored.
    Return(Value),
    /// Run the side effect; nothing is fingerprinted or stored.
    SideEffect(SideEffect),
}

/// Per-call knobs for [`Engine::cache`].
#[derive(Clone, Default)]
pub struct CacheOptions {
    pub ignore: Option<IgnoreMask>,
    pub stack: Option<SharedCallStack>,
    /// Named hook callback bound to this call's fingerprint after it is
    /// added to `stack`.
    pub callback: Option<(String, HookFn)>,
    pub stub: Stub,
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("ignore", &self.ignore)
            .field("stack", &self.stack.as_ref().map(SharedCallStack::key))
            .field("callback", &self.callback.as_ref().map(|(name, _)| name))
            .field("stub", &self.stub)
            .finish()
    }
}

impl CacheOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ignore(mut self, mask: IgnoreMask) -> Self {
        self.ignore = Some(mask);
        self
    }

    #[must_use]
    pub fn stack(mut self, stack: SharedCallStack) -> Self {
        self.stack = Some(stack);
        self
    }

    #[must_use]
    pub fn callback(mut self, name: impl Into<String>, callback: HookFn) -> Self {
        self.callback = Some((name.into(), callback));
        self
    }

    #[must_use]
    pub fn returning(mut self, value: Value) -> Self {
        self.stub = Stub::Return(value);
        self
    }

    #[must_use]
    pub fn side_effect(mut self, effect: SideEffect) -> Self {
        self.stub = Stub::SideEffect(effect);
        self
    }
}

/// Result of one cached call.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached {
    pub value: Value,
    /// `None` when the call bypassed the cache (disabled or stubbed).
    pub fingerprint: Option<Fingerprint>,
    /// Whether the value was replayed from a stored descriptor.
    pub hit: bool,
}

impl Cached {
    const fn bypassed(value: Value) -> Self {
        Self {
            value,
            fingerprint: None,
            hit: false,
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// Removes a fingerprint from the in-flight list when the call finishes.
struct InFlight<'a> {
    calls: &'a Mutex<Vec<Fingerprint>>,
}

impl<'a> InFlight<'a> {
    fn push(calls: &'a Mutex<Vec<Fingerprint>>, fingerprint: Fingerprint) -> Self {
        calls.lock().push(fingerprint);
        Self { calls }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.calls.lock().pop();
    }
}

/// Record/replay cache over one backend.
pub struct Engine {
    enabled: bool,
    backend: Arc<dyn Backend>,
    counter: SequenceCounter,
    descriptors: DescriptorStore,
    stacks: ChunkedStore,
    max_packet_size: usize,
    in_flight: Mutex<Vec<Fingerprint>>,
    contexts: Mutex<HashMap<StackKey, Context>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("enabled", &self.enabled)
            .field("backend", &self.backend.describe())
            .field("in_flight", &self.in_flight.lock().len())
            .field("contexts", &self.contexts.lock().len())
            .finish()
    }
}

impl Engine {
    /// Open the backend named by `config`. A disabled configuration opens
    /// nothing.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        if !config.enabled {
            info!("record/replay cache disabled");
            return Ok(Self::disabled());
        }
        let backend = config.open_backend()?;
        info!(backend = %backend.describe(), "record/replay cache enabled");
        Ok(Self::with_backend(backend, true, config.max_packet_size))
    }

    /// An engine over `backend`. When `enabled` is false the backend is
    /// left untouched and a private in-memory one backs the counters.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn Backend>, enabled: bool, max_packet_size: usize) -> Self {
        let backend: Arc<dyn Backend> = if enabled {
            backend
        } else {
            Arc::new(MemoryBackend::new())
        };
        Self {
            enabled,
            counter: SequenceCounter::new(Arc::clone(&backend)),
            descriptors: DescriptorStore::new(Arc::clone(&backend), max_packet_size),
            stacks: ChunkedStore::new(Arc::clone(&backend), RecordKind::Stack, max_packet_size),
            max_packet_size,
            backend,
            in_flight: Mutex::new(Vec::new()),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// A pass-through engine.
    #[must_use]
    pub fn disabled() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()), false, DEFAULT_MAX_PACKET_SIZE)
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    #[must_use]
    pub const fn counter(&self) -> &SequenceCounter {
        &self.counter
    }

    #[must_use]
    pub const fn descriptors(&self) -> &DescriptorStore {
        &self.descriptors
    }

    #[must_use]
    pub const fn stacks(&self) -> &ChunkedStore {
        &self.stacks
    }

    /// Call `callable` through the cache and return its (possibly replayed)
    /// value.
    pub fn cache(
        &self,
        callable: &dyn Callable,
        site: &CallSite,
        args: &[Value],
        kwargs: &Kwargs,
        options: &CacheOptions,
    ) -> Result<Value> {
        self.cache_traced(callable, site, args, kwargs, options)
            .map(|cached| cached.value)
    }

    /// [`Engine::cache`], also reporting the fingerprint and whether the
    /// value was replayed.
    pub fn cache_traced(
        &self,
        callable: &dyn Callable,
        site: &CallSite,
        args: &[Value],
        kwargs: &Kwargs,
        options: &CacheOptions,
    ) -> Result<Cached> {
        if !self.enabled {
            return callable.call(args, kwargs).map(Cached::bypassed);
        }
        match &options.stub {
            Stub::Cache => {}
            Stub::Return(value) => return Ok(Cached::bypassed(value.clone())),
            Stub::SideEffect(effect) => return effect.run(args, kwargs).map(Cached::bypassed),
        }

        let signature = site.signature_for(callable.name());
        let fp = fingerprint(
            &self.counter,
            args,
            kwargs,
            &signature,
            options.ignore.as_ref(),
        )?;

        let (descriptor, hit) = {
            let _in_flight = InFlight::push(&self.in_flight, fp.clone());
            match self.descriptors.fetch(&fp)? {
                Some(descriptor) => {
                    debug!(fingerprint = fp.short(), method = callable.name(), "cache hit");
                    (descriptor, true)
                }
                None => {
                    debug!(fingerprint = fp.short(), method = callable.name(), "cache miss");
                    let value = callable.call(args, kwargs)?;
                    let descriptor = CallDescriptor::new(fp.clone(), signature, callable.name(), value)
                        .with_arguments(args.to_vec(), kwargs.clone());
                    self.descriptors.save(&descriptor)?;
                    (descriptor, false)
                }
            }
        };

        if let Some(stack) = &options.stack {
            stack.add(&descriptor)?;
            if let Some((name, callback)) = &options.callback {
                stack.register_callback(name.clone(), Arc::clone(callback));
                stack.add_hook(Hook::new(fp.clone(), name.clone()));
            }
        }

        Ok(Cached {
            value: descriptor.return_value,
            fingerprint: Some(fp),
            hit,
        })
    }

    /// Fingerprint of the innermost cached call currently executing.
    #[must_use]
    pub fn current_fingerprint(&self) -> Option<Fingerprint> {
        self.in_flight.lock().last().cloned()
    }

    /// Fingerprint of the outermost cached call currently executing.
    #[must_use]
    pub fn outermost_in_flight(&self) -> Option<Fingerprint> {
        self.in_flight.lock().first().cloned()
    }

    /// Next value of a deterministic counter local to `site`.
    pub fn seq(&self, site: &CallSite) -> Result<u64> {
        self.counter.next_ordinal(&site.signature_for("seq"))
    }

    /// Next deterministic draw in `[0, 1)` local to `site`.
    pub fn random(&self, site: &CallSite) -> Result<f64> {
        self.counter.next_random(&site.signature_for("random"))
    }

    /// Enter the context for `key` and return its call stack.
    ///
    /// The first entry loads the stack stored by an earlier run, if any, or
    /// starts an empty one.
    pub fn enter_context(&self, key: &StackKey) -> Result<SharedCallStack> {
        let mut contexts = self.contexts.lock();
        if let Some(context) = contexts.get_mut(key) {
            context.enter();
            debug!(stack = %key, depth = context.depth(), "context entered");
            return Ok(context.stack().clone());
        }
        let stack: SharedCallStack = match CallStack::load(&self.stacks, key)? {
            Some(stored) => stored.into(),
            None => SharedCallStack::new(key.clone()),
        };
        contexts.insert(key.clone(), Context::new(stack.clone()));
        debug!(stack = %key, depth = 1, "context opened");
        Ok(stack)
    }

    /// Leave one layer of the context for `key`. Leaving the outermost layer
    /// saves the call stack (once) and closes the context.
    pub fn exit_context(&self, key: &StackKey) -> Result<()> {
        let finished = {
            let mut contexts = self.contexts.lock();
            let Some(context) = contexts.get_mut(key) else {
                return Err(RcacheError::ContextUnderflow {
                    key: key.to_string(),
                });
            };
            if context.exit()? {
                contexts.remove(key)
            } else {
                debug!(stack = %key, depth = context.depth(), "context exited");
                None
            }
        };
        if let Some(context) = finished {
            if self.enabled {
                context.stack().lock().save(&self.stacks)?;
            }
            debug!(stack = %key, "context closed");
        }
        Ok(())
    }

    /// Depth of the open context for `key`, or 0.
    #[must_use]
    pub fn context_depth(&self, key: &StackKey) -> u32 {
        self.contexts.lock().get(key).map_or(0, Context::depth)
    }

    /// Delete every record not used since the last sweep.
    pub fn purge_unused(&self) -> Result<PurgeReport> {
        rcache_store::purge_unused(self.backend.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rcache_types::kwargs;

    use super::*;

    fn engine() -> Engine {
        Engine::with_backend(Arc::new(MemoryBackend::new()), true, DEFAULT_MAX_PACKET_SIZE)
    }

    fn counting(name: &str) -> (Arc<AtomicUsize>, NamedFn) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let f = NamedFn::new(name, move |args: &[Value], _: &Kwargs| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(args.iter().filter_map(Value::as_int).sum()))
        });
        (calls, f)
    }

    #[test]
    fn test_miss_records_and_hit_replays() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let site = CallSite::suite("tests.engine", "test_replay");
        let (calls, add) = counting("add");
        let args = [Value::Int(1), Value::Int(2)];

        let first = Engine::with_backend(Arc::clone(&backend), true, DEFAULT_MAX_PACKET_SIZE);
        let recorded = first
            .cache_traced(&add, &site, &args, &Kwargs::new(), &CacheOptions::new())
            .unwrap();
        assert!(!recorded.hit);
        assert_eq!(recorded.value, Value::Int(3));

        let second = Engine::with_backend(backend, true, DEFAULT_MAX_PACKET_SIZE);
        let replayed = second
            .cache_traced(&add, &site, &args, &Kwargs::new(), &CacheOptions::new())
            .unwrap();
        assert!(replayed.hit);
        assert_eq!(replayed.value, Value::Int(3));
        assert_eq!(replayed.fingerprint, recorded.fingerprint);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_call_is_not_recorded() {
        let engine = engine();
        let site = CallSite::suite("tests.engine", "test_fail");
        let fail = NamedFn::new("fail", |_: &[Value], _: &Kwargs| {
            Err(RcacheError::callable(std::io::Error::other("boom")))
        });
        let err = engine
            .cache(&fail, &site, &[], &Kwargs::new(), &CacheOptions::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(engine.descriptors().fingerprints().unwrap().is_empty());
        assert!(engine.current_fingerprint().is_none());
    }

    #[test]
    fn test_stubs_bypass_the_store() {
        let engine = engine();
        let site = CallSite::suite("tests.engine", "test_stub");
        let (calls, add) = counting("add");

        let value = engine
            .cache(
                &add,
                &site,
                &[Value::Int(1)],
                &Kwargs::new(),
                &CacheOptions::new().returning(Value::from("stubbed")),
            )
            .unwrap();
        assert_eq!(value, Value::from("stubbed"));

        let err = engine
            .cache(
                &add,
                &site,
                &[],
                &Kwargs::new(),
                &CacheOptions::new().side_effect(SideEffect::raise("ValueError", "nope")),
            )
            .unwrap_err();
        assert!(matches!(err, RcacheError::Raised { ref name, .. } if name == "ValueError"));

        let (other_calls, other) = counting("other");
        let value = engine
            .cache(
                &add,
                &site,
                &[Value::Int(4), Value::Int(5)],
                &Kwargs::new(),
                &CacheOptions::new().side_effect(SideEffect::Call(Arc::new(other))),
            )
            .unwrap();
        assert_eq!(value, Value::Int(9));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(other_calls.load(Ordering::SeqCst), 1);
        assert!(engine.descriptors().fingerprints().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_engine_passes_through() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = Engine::with_backend(backend.clone(), false, DEFAULT_MAX_PACKET_SIZE);
        let site = CallSite::suite("tests.engine", "test_disabled");
        let (calls, add) = counting("add");
        for _ in 0..2 {
            let value = engine
                .cache(
                    &add,
                    &site,
                    &[Value::Int(2)],
                    &Kwargs::new(),
                    &CacheOptions::new().returning(Value::Null),
                )
                .unwrap();
            assert_eq!(value, Value::Int(2));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_callback_fires_on_next_occurrence() {
        let engine = engine();
        let site = CallSite::suite("tests.engine", "test_callback");
        let key = StackKey::new("tests.engine", "test_callback");
        let stack = engine.enter_context(&key).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        let callback: HookFn = Arc::new(move |_: &CallDescriptor, _: &Hook| -> Result<()> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let (_, add) = counting("add");
        let options = CacheOptions::new()
            .stack(stack.clone())
            .callback("notify", callback);

        let cached = engine
            .cache_traced(&add, &site, &[Value::Int(1)], &kwargs([("k", 1)]), &options)
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let fp = cached.fingerprint.unwrap();
        let replay = engine.descriptors().fetch(&fp).unwrap().unwrap();
        stack.add(&replay).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(stack.calls(), vec![fp.clone(), fp]);
        engine.exit_context(&key).unwrap();
    }

    #[test]
    fn test_context_saves_stack_once_at_outermost_exit() {
        let engine = engine();
        let key = StackKey::new("tests.engine", "test_nested");
        let outer = engine.enter_context(&key).unwrap();
        let inner = engine.enter_context(&key).unwrap();
        assert_eq!(engine.context_depth(&key), 2);
        assert_eq!(outer.key(), inner.key());

        engine.exit_context(&key).unwrap();
        assert!(!engine.stacks().contains(&key.storage_key()).unwrap());
        engine.exit_context(&key).unwrap();
        assert!(engine.stacks().contains(&key.storage_key()).unwrap());
        assert_eq!(engine.context_depth(&key), 0);

        assert!(matches!(
            engine.exit_context(&key),
            Err(RcacheError::ContextUnderflow { .. })
        ));
    }

    #[test]
    fn test_seq_and_random_are_replayed() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let site = CallSite::suite("tests.engine", "test_seq");
        let first = Engine::with_backend(Arc::clone(&backend), true, DEFAULT_MAX_PACKET_SIZE);
        assert_eq!(first.seq(&site).unwrap(), 0);
        assert_eq!(first.seq(&site).unwrap(), 1);
        let draws: Vec<f64> = (0..2).map(|_| first.random(&site).unwrap()).collect();

        let second = Engine::with_backend(backend, true, DEFAULT_MAX_PACKET_SIZE);
        assert_eq!(second.seq(&site).unwrap(), 0);
        let replayed: Vec<f64> = (0..2).map(|_| second.random(&site).unwrap()).collect();
        assert_eq!(draws, replayed);
    }
}
