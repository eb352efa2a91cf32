//! Record/replay cache for test doubles.
//!
//! Calls made through an [`Engine`] are fingerprinted from their
//! normalized arguments, the caller-supplied [`CallSite`] and a per-site
//! ordinal. The first run executes and records each call; later runs replay
//! the recorded return values without touching the real collaborator.
//!
//! ```text
//! CallSite ─▶ fingerprint ─▶ DescriptorStore ─hit─▶ stored value
//!                                   │
//!                                  miss ─▶ callable ─▶ save ─▶ value
//! ```
//!
//! Patching goes through a [`Registry`] of named targets rather than
//! rewriting live symbols, and dependencies are wrapped by a [`Facade`]
//! over the explicit [`Dependency`] interface.

pub mod callsite;
pub mod config;
pub mod context;
pub mod counter;
pub mod descriptors;
pub mod engine;
pub mod expected;
pub mod facade;
pub mod fingerprint;
pub mod hooks;
pub mod logging;
pub mod normalize;
pub mod patch;

pub use callsite::{CallSite, Frame};
pub use config::{BackendConfig, CacheConfig};
pub use context::Context;
pub use counter::SequenceCounter;
pub use descriptors::DescriptorStore;
pub use engine::{CacheOptions, Cached, Callable, Engine, NamedFn, SideEffect, Stub};
pub use expected::ExpectedValues;
pub use facade::{Dependency, Facade};
pub use fingerprint::{digest, fingerprint};
pub use hooks::{CallStack, Hook, HookFn, SharedCallStack, StackKey};
pub use logging::{LogFormat, init_tracing};
pub use normalize::{normalize, normalize_args, normalize_kwargs};
pub use patch::{Patch, Registry, with_patches};

pub use rcache_error::{RcacheError, Result};
pub use rcache_types::{CallDescriptor, Fingerprint, IgnoreMask, Kwargs, Value, kwargs};
