//! Incremental file-transform cache.
//!
//! Sits in front of a module resolver and a pool of out-of-process
//! transform workers: a request for a source file (optionally the legacy
//! `?dew` variant) yields the transformed source, a source map, and a
//! stable content hash. Repeat requests with an unchanged input graph are
//! served from the cache, and a caller that already knows the hash gets a
//! not-modified reply without any worker round trip.
//!
//! Freshness combines bounded filesystem watches, mtime probing, and a
//! periodically cleared resolver lookup cache, all folded into the
//! composite content hash that drives cache validity.

mod cache;
mod config;
mod engine;
mod error;
mod hash;
mod pool;
mod record;
mod resolver;
mod transform;
mod watch;

pub use cache::{TransformCache, TransformResult};
pub use config::Config;
pub use engine::{EngineReply, EngineRequest, ReplyData, ResolveMap, TransformEngine};
pub use error::Error;
pub use resolver::{
    FormatOpts, ModuleFormat, ModuleResolver, ResolveOpts, Resolution, ResolverCache, ResolverEnv,
    ResolverFuture,
};
