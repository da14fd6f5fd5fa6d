//! Module resolver boundary and the caching facade over it.
//!
//! The resolver itself is an external collaborator: a pure function from
//! specifier + parent to resolved path and format, consulting a lookup
//! cache it treats as an opaque bag. The facade owns that bag and wipes it
//! wholesale on a fixed interval; the wipe is cheaper than invalidation,
//! which is why the resolve-map hash is part of every record's full hash.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Error;
use crate::record::now_millis;

pub type ResolverFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Module formats the resolver can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    Module,
    Legacy,
    Json,
    Builtin,
    Unknown,
}

/// Outcome of resolving a specifier against a parent module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved path, or the builtin name for [`ModuleFormat::Builtin`].
    pub resolved: String,
    pub format: ModuleFormat,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverEnv {
    pub production: bool,
    pub browser: bool,
}

pub struct ResolveOpts {
    pub cache: Arc<ResolverCache>,
    pub env: ResolverEnv,
    pub legacy: bool,
}

pub struct FormatOpts {
    pub cache: Arc<ResolverCache>,
    pub legacy: bool,
}

/// The external module resolver.
pub trait ModuleResolver: Send + Sync {
    fn resolve(
        &self,
        specifier: &str,
        parent: &str,
        opts: ResolveOpts,
    ) -> ResolverFuture<Result<Resolution, Error>>;

    fn format(&self, path: &str, opts: FormatOpts) -> ResolverFuture<Result<ModuleFormat, Error>>;

    /// The package root containing `path`, if any.
    fn package_path(&self, path: &str, cache: Arc<ResolverCache>) -> ResolverFuture<Option<String>>;
}

/// Opaque lookup cache consumed by resolver implementations. Keyed JSON
/// values; the facade never inspects them.
#[derive(Debug, Default)]
pub struct ResolverCache {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl ResolverCache {
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.lock().insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Facade over the external resolver: shared cache bag, trailing-slash
/// stripping, and the expiry clock driving freshness checks.
pub(crate) struct ResolverFacade {
    resolver: Arc<dyn ModuleResolver>,
    env: ResolverEnv,
    cache: Mutex<Arc<ResolverCache>>,
    next_expiry: AtomicU64,
}

impl ResolverFacade {
    pub(crate) fn new(
        resolver: Arc<dyn ModuleResolver>,
        production: bool,
        clear_interval: Duration,
    ) -> Self {
        ResolverFacade {
            resolver,
            env: ResolverEnv {
                production,
                browser: true,
            },
            cache: Mutex::new(Arc::new(ResolverCache::default())),
            next_expiry: AtomicU64::new(now_millis() + clear_interval.as_millis() as u64),
        }
    }

    pub(crate) fn cache(&self) -> Arc<ResolverCache> {
        self.cache.lock().clone()
    }

    /// Wholesale cache wipe; advances the expiry window.
    pub(crate) fn clear_cache(&self, clear_interval: Duration) {
        let fresh = Arc::new(ResolverCache::default());
        let stale = std::mem::replace(&mut *self.cache.lock(), fresh);
        self.next_expiry
            .store(now_millis() + clear_interval.as_millis() as u64, Ordering::SeqCst);
        debug!(entries = stale.len(), "resolver cache cleared");
    }

    pub(crate) fn next_expiry(&self) -> u64 {
        self.next_expiry.load(Ordering::SeqCst)
    }

    pub(crate) async fn resolve(
        &self,
        specifier: &str,
        parent: &str,
        legacy: bool,
    ) -> Result<Resolution, Error> {
        let specifier = specifier.strip_suffix('/').unwrap_or(specifier);
        self.resolver
            .resolve(
                specifier,
                parent,
                ResolveOpts {
                    cache: self.cache(),
                    env: self.env,
                    legacy,
                },
            )
            .await
    }

    pub(crate) async fn format(&self, path: &str, legacy: bool) -> Result<ModuleFormat, Error> {
        self.resolver
            .format(
                path,
                FormatOpts {
                    cache: self.cache(),
                    legacy,
                },
            )
            .await
    }

    pub(crate) async fn package_path(&self, path: &str) -> Option<String> {
        self.resolver.package_path(path, self.cache()).await
    }
}
