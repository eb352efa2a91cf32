//! Side effects bound to cached calls fire exactly once per run, whether
//! the call is recorded or replayed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rcache_core::{
    BackendConfig, CacheConfig, CallDescriptor, CallSite, CallStack, Callable, Engine, Hook,
    Kwargs, NamedFn, Patch, RcacheError, Registry, Result, StackKey, Value, with_patches,
};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Arc<Engine> {
    let config = CacheConfig::enabled_with(BackendConfig::FlatFile {
        root: dir.path().to_path_buf(),
    });
    Arc::new(Engine::open(&config).expect("open engine"))
}

/// A registry where `billing.charge` notifies `mail.send` from inside.
fn registry(charges: &Arc<AtomicUsize>, mails: &Arc<AtomicUsize>) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());

    let sent = Arc::clone(mails);
    let send: Arc<dyn Callable> = Arc::new(NamedFn::new(
        "send",
        move |args: &[Value], _: &Kwargs| {
            assert_eq!(args, [Value::from("receipt")]);
            sent.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        },
    ));
    registry.register("mail.send", send);

    let charged = Arc::clone(charges);
    let inner = Arc::clone(&registry);
    let charge: Arc<dyn Callable> = Arc::new(NamedFn::new(
        "charge",
        move |args: &[Value], _: &Kwargs| {
            charged.fetch_add(1, Ordering::SeqCst);
            inner.call("mail.send", &[Value::from("receipt")], &Kwargs::new())?;
            Ok(Value::map([("charged", args.first().cloned().unwrap_or_default())]))
        },
    ));
    registry.register("billing.charge", charge);
    registry
}

fn run_checkout(engine: &Arc<Engine>, registry: &Registry) -> Value {
    let key = StackKey::new("tests.replay_hooks", "test_checkout");
    let site = CallSite::suite("tests.replay_hooks", "test_checkout");
    with_patches(
        engine,
        registry,
        &key,
        &site,
        &[Patch::cached("billing.charge"), Patch::replay("mail.send")],
        || registry.call("billing.charge", &[Value::Int(250)], &Kwargs::new()),
    )
    .expect("checkout")
}

#[test]
fn test_side_effect_fires_once_when_recording_and_once_when_replaying() {
    let dir = tempfile::tempdir().expect("tempdir");
    let charges = Arc::new(AtomicUsize::new(0));
    let mails = Arc::new(AtomicUsize::new(0));

    let recording = open(&dir);
    let recorded = run_checkout(&recording, &registry(&charges, &mails));
    assert_eq!(charges.load(Ordering::SeqCst), 1);
    assert_eq!(mails.load(Ordering::SeqCst), 1);

    let stored = CallStack::load(
        recording.stacks(),
        &StackKey::new("tests.replay_hooks", "test_checkout"),
    )
    .expect("load")
    .expect("stack saved at outermost exit");
    assert_eq!(stored.calls().len(), 1);
    let hooks = stored.hooks_for(&stored.calls()[0]);
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].callback, "mail.send");
    assert_eq!(stored.pending_skips(&stored.calls()[0]), 0);

    let replaying = open(&dir);
    let replayed = run_checkout(&replaying, &registry(&charges, &mails));
    assert_eq!(replayed, recorded);
    assert_eq!(charges.load(Ordering::SeqCst), 1);
    assert_eq!(mails.load(Ordering::SeqCst), 2);
}

#[test]
fn test_replay_target_outside_cached_call_just_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&dir);
    let charges = Arc::new(AtomicUsize::new(0));
    let mails = Arc::new(AtomicUsize::new(0));
    let registry = registry(&charges, &mails);
    let key = StackKey::new("tests.replay_hooks", "test_direct");
    let site = CallSite::suite("tests.replay_hooks", "test_direct");

    with_patches(&engine, &registry, &key, &site, &[Patch::replay("mail.send")], || {
        registry.call("mail.send", &[Value::from("receipt")], &Kwargs::new())
    })
    .expect("direct send");
    assert_eq!(mails.load(Ordering::SeqCst), 1);
    let stored = CallStack::load(engine.stacks(), &key).expect("load").expect("saved");
    assert!(stored.calls().is_empty());
}

#[test]
fn test_exiting_an_unopened_context_fails_loudly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&dir);
    let key = StackKey::new("tests.replay_hooks", "test_underflow");
    engine.enter_context(&key).expect("enter");
    engine.exit_context(&key).expect("exit");
    let err = engine.exit_context(&key).expect_err("underflow");
    assert!(matches!(err, RcacheError::ContextUnderflow { ref key } if key == "tests.replay_hooks.test_underflow"));
}

#[test]
fn test_stored_stack_is_not_overwritten_by_a_later_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key = StackKey::new("tests.replay_hooks", "test_keep");
    let fired = Arc::new(AtomicUsize::new(0));

    let first = open(&dir);
    let stack = first.enter_context(&key).expect("enter");
    let seen = Arc::clone(&fired);
    stack.register_callback(
        "count",
        Arc::new(move |_: &CallDescriptor, _: &Hook| -> Result<()> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    let fp = rcache_core::digest(&[], &Kwargs::new(), "sig", 0, None);
    stack.add_hook(Hook::new(fp.clone(), "count"));
    first.exit_context(&key).expect("exit");

    let second = open(&dir);
    let reloaded = second.enter_context(&key).expect("enter");
    reloaded.add_hook(Hook::new(fp.clone(), "count"));
    second.exit_context(&key).expect("exit");

    let stored = CallStack::load(second.stacks(), &key).expect("load").expect("stored");
    assert_eq!(stored.hooks_for(&fp).len(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
