//! Table-driven patching.
//!
//! Code under test reaches its collaborators through a [`Registry`] that
//! maps logical target names to implementations. A test swaps targets for
//! cached, stubbed or replaying stand-ins for the duration of a body with
//! [`with_patches`], and the originals are put back afterwards whatever
//! the body returned.
//!
//! Each patch applied to a test is one layer of that test's context: the
//! call stack is shared by all layers and saved when the last one exits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rcache_error::{RcacheError, Result};
use rcache_types::{CallDescriptor, IgnoreMask, Kwargs, Value};
use tracing::{debug, warn};

use crate::callsite::CallSite;
use crate::engine::{CacheOptions, Callable, Engine, SideEffect};
use crate::hooks::{Hook, HookFn, SharedCallStack, StackKey};

// ── Registry ─────────────────────────────────────────────────────────

/// Logical target name to current implementation.
#[derive(Default)]
pub struct Registry {
    slots: Mutex<HashMap<String, Arc<dyn Callable>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        let mut targets: Vec<&str> = slots.keys().map(String::as_str).collect();
        targets.sort_unstable();
        f.debug_struct("Registry").field("targets", &targets).finish()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `target` to its production implementation.
    pub fn register(&self, target: impl Into<String>, implementation: Arc<dyn Callable>) {
        self.slots.lock().insert(target.into(), implementation);
    }

    #[must_use]
    pub fn get(&self, target: &str) -> Option<Arc<dyn Callable>> {
        self.slots.lock().get(target).cloned()
    }

    /// Put `replacement` in place of `target` and return what was there.
    pub fn install(&self, target: &str, replacement: Arc<dyn Callable>) -> Result<Arc<dyn Callable>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(target).ok_or_else(|| RcacheError::UnknownTarget {
            target: target.to_owned(),
        })?;
        Ok(std::mem::replace(slot, replacement))
    }

    /// Put `original` back in place of `target`.
    pub fn restore(&self, target: &str, original: Arc<dyn Callable>) {
        self.slots.lock().insert(target.to_owned(), original);
    }

    /// Call whatever currently implements `target`.
    ///
    /// The registry lock is not held during the call, so implementations
    /// may call other targets.
    pub fn call(&self, target: &str, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        let implementation = self.get(target).ok_or_else(|| RcacheError::UnknownTarget {
            target: target.to_owned(),
        })?;
        implementation.call(args, kwargs)
    }
}

// ── Patch layers ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Mode {
    Cached,
    Returning(Value),
    SideEffect(SideEffect),
    Replay,
}

/// One patch layer: what to put in place of a target.
#[derive(Debug, Clone)]
pub struct Patch {
    target: String,
    mode: Mode,
    ignore: Option<IgnoreMask>,
}

impl Patch {
    /// Route calls through the record/replay cache.
    #[must_use]
    pub fn cached(target: impl Into<String>) -> Self {
        Self::with_mode(target, Mode::Cached)
    }

    /// Answer every call with `value`.
    #[must_use]
    pub fn returning(target: impl Into<String>, value: Value) -> Self {
        Self::with_mode(target, Mode::Returning(value))
    }

    /// Run `effect` instead of the target.
    #[must_use]
    pub fn side_effect(target: impl Into<String>, effect: SideEffect) -> Self {
        Self::with_mode(target, Mode::SideEffect(effect))
    }

    /// Make a side-effecting collaborator fire exactly once per run: for
    /// real while recording the cached call it happens under, and from the
    /// stored call stack when that call is replayed.
    #[must_use]
    pub fn replay(target: impl Into<String>) -> Self {
        Self::with_mode(target, Mode::Replay)
    }

    /// Exclude arguments from the fingerprint of cached calls.
    #[must_use]
    pub fn ignoring(mut self, mask: IgnoreMask) -> Self {
        self.ignore = Some(mask);
        self
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    fn with_mode(target: impl Into<String>, mode: Mode) -> Self {
        Self {
            target: target.into(),
            mode,
            ignore: None,
        }
    }

    fn replacement(
        &self,
        engine: &Arc<Engine>,
        site: &CallSite,
        stack: &SharedCallStack,
        original: Arc<dyn Callable>,
    ) -> Arc<dyn Callable> {
        let options = CacheOptions {
            ignore: self.ignore.clone(),
            stack: Some(stack.clone()),
            ..CacheOptions::default()
        };
        let options = match &self.mode {
            Mode::Cached => options,
            Mode::Returning(value) => options.returning(value.clone()),
            Mode::SideEffect(effect) => options.side_effect(effect.clone()),
            Mode::Replay => {
                stack.register_callback(self.target.clone(), replay_callback(Arc::clone(&original)));
                return Arc::new(Replaying {
                    engine: Arc::clone(engine),
                    stack: stack.clone(),
                    target: self.target.clone(),
                    original,
                });
            }
        };
        Arc::new(CachedStandIn {
            engine: Arc::clone(engine),
            site: site.clone(),
            options,
            original,
        })
    }
}

struct CachedStandIn {
    engine: Arc<Engine>,
    site: CallSite,
    options: CacheOptions,
    original: Arc<dyn Callable>,
}

impl Callable for CachedStandIn {
    fn name(&self) -> &str {
        self.original.name()
    }

    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        self.engine
            .cache(self.original.as_ref(), &self.site, args, kwargs, &self.options)
    }
}

struct Replaying {
    engine: Arc<Engine>,
    stack: SharedCallStack,
    target: String,
    original: Arc<dyn Callable>,
}

impl Callable for Replaying {
    fn name(&self) -> &str {
        self.original.name()
    }

    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        let Some(outer) = self.engine.outermost_in_flight() else {
            return self.original.call(args, kwargs);
        };
        let value = self.original.call(args, kwargs)?;
        self.stack.add_hook(
            Hook::new(outer.clone(), self.target.clone()).with_arguments(args.to_vec(), kwargs.clone()),
        );
        self.stack.skip_once(&outer);
        debug!(patched = %self.target, fingerprint = outer.short(), "side effect bound for replay");
        Ok(value)
    }
}

fn replay_callback(original: Arc<dyn Callable>) -> HookFn {
    Arc::new(move |_: &CallDescriptor, hook: &Hook| -> Result<()> {
        original.call(&hook.args, &hook.kwargs).map(|_| ())
    })
}

// ── Applying layers ──────────────────────────────────────────────────

/// Run `body` with every patch in `patches` installed.
///
/// Each patch enters the context for `key` once; afterwards the originals
/// are restored in reverse order and each layer exits, which saves the call
/// stack when the outermost one does. An error from `body` wins over one
/// from cleanup. A disabled engine runs `body` unpatched.
pub fn with_patches<T, F>(
    engine: &Arc<Engine>,
    registry: &Registry,
    key: &StackKey,
    site: &CallSite,
    patches: &[Patch],
    body: F,
) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    if !engine.is_enabled() {
        return body();
    }

    let mut installed: Vec<(String, Arc<dyn Callable>)> = Vec::with_capacity(patches.len());
    let mut entered = 0_usize;
    let outcome = install_all(engine, registry, key, site, patches, &mut installed, &mut entered)
        .and_then(|()| body());

    for (target, original) in installed.into_iter().rev() {
        registry.restore(&target, original);
    }
    let mut cleanup = Ok(());
    for _ in 0..entered {
        if let Err(err) = engine.exit_context(key) {
            warn!(stack = %key, error = %err, "context exit failed");
            if cleanup.is_ok() {
                cleanup = Err(err);
            }
        }
    }

    let value = outcome?;
    cleanup?;
    Ok(value)
}

fn install_all(
    engine: &Arc<Engine>,
    registry: &Registry,
    key: &StackKey,
    site: &CallSite,
    patches: &[Patch],
    installed: &mut Vec<(String, Arc<dyn Callable>)>,
    entered: &mut usize,
) -> Result<()> {
    for patch in patches {
        let stack = engine.enter_context(key)?;
        *entered += 1;
        let original = registry
            .get(&patch.target)
            .ok_or_else(|| RcacheError::UnknownTarget {
                target: patch.target.clone(),
            })?;
        let replacement = patch.replacement(engine, site, &stack, Arc::clone(&original));
        let previous = registry.install(&patch.target, replacement)?;
        installed.push((patch.target.clone(), previous));
        debug!(stack = %key, patched = %patch.target, "patch installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rcache_store::{DEFAULT_MAX_PACKET_SIZE, MemoryBackend};

    use super::*;
    use crate::engine::NamedFn;

    fn counting(name: &str, value: i64) -> (Arc<AtomicUsize>, Arc<dyn Callable>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let f: Arc<dyn Callable> = Arc::new(NamedFn::new(name, move |_: &[Value], _: &Kwargs| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int(value))
        }));
        (calls, f)
    }

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::with_backend(
            Arc::new(MemoryBackend::new()),
            true,
            DEFAULT_MAX_PACKET_SIZE,
        ))
    }

    #[test]
    fn test_install_and_restore_round_trip() {
        let registry = Registry::new();
        let (_, real) = counting("real", 1);
        let (_, fake) = counting("fake", 2);
        registry.register("svc.lookup", Arc::clone(&real));

        let original = registry.install("svc.lookup", fake).unwrap();
        assert_eq!(original.name(), "real");
        assert_eq!(registry.call("svc.lookup", &[], &Kwargs::new()).unwrap(), Value::Int(2));
        registry.restore("svc.lookup", original);
        assert_eq!(registry.call("svc.lookup", &[], &Kwargs::new()).unwrap(), Value::Int(1));

        assert!(matches!(
            registry.call("svc.missing", &[], &Kwargs::new()),
            Err(RcacheError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn test_patches_restore_and_save_stack() {
        let engine = engine();
        let registry = Registry::new();
        let (calls, lookup) = counting("lookup", 7);
        let (_, clock) = counting("clock", 0);
        registry.register("svc.lookup", lookup);
        registry.register("svc.clock", clock);
        let key = StackKey::new("tests.patch", "test_layers");
        let site = CallSite::suite("tests.patch", "test_layers");

        let observed = with_patches(
            &engine,
            &registry,
            &key,
            &site,
            &[
                Patch::cached("svc.lookup"),
                Patch::returning("svc.clock", Value::Int(1_700_000_000)),
            ],
            || {
                assert_eq!(engine.context_depth(&key), 2);
                let a = registry.call("svc.lookup", &[Value::Int(1)], &Kwargs::new())?;
                let t = registry.call("svc.clock", &[], &Kwargs::new())?;
                Ok((a, t))
            },
        )
        .unwrap();

        assert_eq!(observed, (Value::Int(7), Value::Int(1_700_000_000)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.context_depth(&key), 0);
        assert!(engine.stacks().contains(&key.storage_key()).unwrap());
        assert_eq!(registry.get("svc.clock").unwrap().name(), "clock");
        assert_eq!(registry.call("svc.clock", &[], &Kwargs::new()).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_body_error_still_restores() {
        let engine = engine();
        let registry = Registry::new();
        let (_, lookup) = counting("lookup", 7);
        registry.register("svc.lookup", lookup);
        let key = StackKey::new("tests.patch", "test_error");
        let site = CallSite::suite("tests.patch", "test_error");

        let result: Result<()> = with_patches(
            &engine,
            &registry,
            &key,
            &site,
            &[Patch::side_effect("svc.lookup", SideEffect::raise("KeyError", "k"))],
            || registry.call("svc.lookup", &[], &Kwargs::new()).map(|_| ()),
        );
        assert!(matches!(result, Err(RcacheError::Raised { .. })));
        assert_eq!(registry.get("svc.lookup").unwrap().name(), "lookup");
        assert_eq!(engine.context_depth(&key), 0);
    }

    #[test]
    fn test_unknown_target_exits_entered_layers() {
        let engine = engine();
        let registry = Registry::new();
        let key = StackKey::new("tests.patch", "test_unknown");
        let site = CallSite::suite("tests.patch", "test_unknown");
        let result = with_patches(&engine, &registry, &key, &site, &[Patch::cached("nope")], || {
            Ok(())
        });
        assert!(matches!(result, Err(RcacheError::UnknownTarget { .. })));
        assert_eq!(engine.context_depth(&key), 0);
    }
}
