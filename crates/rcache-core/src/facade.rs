//! Cached wrapper around a whole dependency.
//!
//! A [`Facade`] stands in front of something implementing [`Dependency`]
//! and routes its method calls through the [`Engine`]. The method name is
//! qualified with the dependency's type name, so methods of different
//! dependencies never share fingerprints.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rcache_error::{RcacheError, Result};
use rcache_types::{Fingerprint, Kwargs, Value};
use tracing::debug;

use crate::callsite::CallSite;
use crate::engine::{CacheOptions, Callable, Engine};
use crate::hooks::SharedCallStack;

/// The operations a wrapped dependency exposes.
pub trait Dependency: Send + Sync {
    fn type_name(&self) -> &str;

    fn call_method(&self, method: &str, args: &[Value], kwargs: &Kwargs) -> Result<Value>;

    /// Plain data field, read without caching.
    fn attribute(&self, _name: &str) -> Option<Value> {
        None
    }
}

type Builder<D> = Box<dyn Fn() -> Result<D> + Send + Sync>;

struct BoundMethod<'a, D: Dependency> {
    dependency: &'a D,
    method: &'a str,
    qualified: String,
}

impl<D: Dependency> Callable for BoundMethod<'_, D> {
    fn name(&self) -> &str {
        &self.qualified
    }

    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        self.dependency.call_method(self.method, args, kwargs)
    }
}

/// Caching wrapper around one dependency instance.
pub struct Facade<D: Dependency> {
    engine: Arc<Engine>,
    dependency: OnceLock<D>,
    builder: Mutex<Option<Builder<D>>>,
    excluded: BTreeSet<String>,
    stack: Option<SharedCallStack>,
    last: Mutex<Option<Fingerprint>>,
}

impl<D: Dependency> fmt::Debug for Facade<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Facade")
            .field("type_name", &self.dependency.get().map(D::type_name))
            .field("excluded", &self.excluded)
            .field("last", &*self.last.lock())
            .finish_non_exhaustive()
    }
}

impl<D: Dependency> Facade<D> {
    #[must_use]
    pub fn new(engine: Arc<Engine>, dependency: D) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(dependency);
        Self::with_cell(engine, cell, None)
    }

    /// A facade whose dependency is built on first use. A failed build is
    /// retried on the next call.
    pub fn lazy<F>(engine: Arc<Engine>, builder: F) -> Self
    where
        F: Fn() -> Result<D> + Send + Sync + 'static,
    {
        Self::with_cell(engine, OnceLock::new(), Some(Box::new(builder)))
    }

    fn with_cell(engine: Arc<Engine>, dependency: OnceLock<D>, builder: Option<Builder<D>>) -> Self {
        Self {
            engine,
            dependency,
            builder: Mutex::new(builder),
            excluded: BTreeSet::new(),
            stack: None,
            last: Mutex::new(None),
        }
    }

    /// Call `method` on the real dependency every time.
    #[must_use]
    pub fn exclude(mut self, method: impl Into<String>) -> Self {
        self.excluded.insert(method.into());
        self
    }

    /// Append every cached call to `stack`.
    #[must_use]
    pub fn with_stack(mut self, stack: SharedCallStack) -> Self {
        self.stack = Some(stack);
        self
    }

    /// The wrapped dependency, building it if needed.
    pub fn inner(&self) -> Result<&D> {
        if let Some(dependency) = self.dependency.get() {
            return Ok(dependency);
        }
        let builder = self.builder.lock();
        if let Some(dependency) = self.dependency.get() {
            return Ok(dependency);
        }
        let build = builder
            .as_ref()
            .ok_or_else(|| RcacheError::internal("facade has neither a dependency nor a builder"))?;
        let built = build()?;
        debug!(type_name = built.type_name(), "facade dependency built");
        let _ = self.dependency.set(built);
        self.dependency
            .get()
            .ok_or_else(|| RcacheError::internal("facade dependency vanished after build"))
    }

    /// Call `method` through the cache, unless it is excluded.
    pub fn call(&self, site: &CallSite, method: &str, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
        let dependency = self.inner()?;
        if self.excluded.contains(method) {
            return dependency.call_method(method, args, kwargs);
        }
        let bound = BoundMethod {
            dependency,
            method,
            qualified: format!("{}.{method}", dependency.type_name()),
        };
        let options = CacheOptions {
            stack: self.stack.clone(),
            ..CacheOptions::default()
        };
        let cached = self.engine.cache_traced(&bound, site, args, kwargs, &options)?;
        if let Some(fingerprint) = cached.fingerprint {
            *self.last.lock() = Some(fingerprint);
        }
        Ok(cached.value)
    }

    /// Read a plain attribute of the dependency.
    pub fn attribute(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.inner()?.attribute(name))
    }

    /// Fingerprint of the last call this facade answered from the cache.
    #[must_use]
    pub fn last_fingerprint(&self) -> Option<Fingerprint> {
        self.last.lock().clone()
    }

    /// Drop the descriptor of the last cached call, so the next run records
    /// it again. Returns whether one was stored.
    pub fn delete_last_cached(&self) -> Result<bool> {
        let Some(fingerprint) = self.last.lock().take() else {
            return Ok(false);
        };
        Ok(self.engine.descriptors().delete(&fingerprint)? > 0)
    }
}
