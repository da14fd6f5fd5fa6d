//! Transform phase: turns analyzed source plus its resolve map into the
//! served output, with fast paths for JSON and dependency-free modules.

use std::sync::Arc;

use tracing::debug;

use crate::cache::Shared;
use crate::error::Error;
use crate::hash::HashOutcome;
use crate::record::{Record, Variant, is_json_path};

/// Wrapper emitted for JSON sources in place of a worker round trip.
pub(crate) const JSON_WRAPPER_PREFIX: &str = "export var __dew__ = null; export var exports = ";

/// Runs one transform phase for `record` against the resolve map of the
/// hash generation in `outcome`.
pub(crate) async fn run(
    shared: Arc<Shared>,
    record: Arc<Record>,
    outcome: HashOutcome,
) -> Result<(), Error> {
    let probe = tokio::spawn(global_cache_probe(shared.clone(), record.path.clone()));
    let result = run_inner(&shared, &record, &outcome).await;

    let is_global_cache = probe.await.unwrap_or(false);
    {
        let mut state = record.state.lock();
        state.is_global_cache = is_global_cache;
        // JSON keeps its completed handle: there is no dependency
        // invalidation distinct from a source change, so the transform is
        // done until the source itself changes.
        if !is_json_path(&record.path) {
            state.transform_pending = None;
        }
    }
    result
}

async fn run_inner(
    shared: &Arc<Shared>,
    record: &Arc<Record>,
    outcome: &HashOutcome,
) -> Result<(), Error> {
    let (source, deps_empty) = {
        let state = record.state.lock();
        (
            state.original_source.clone().unwrap_or_default(),
            state.deps.as_ref().is_none_or(|deps| deps.is_empty()),
        )
    };

    if is_json_path(&record.path) {
        let wrapped = format!("{JSON_WRAPPER_PREFIX}{source}");
        let mut state = record.state.lock();
        state.source = Some(wrapped);
        state.source_map = None;
        return Ok(());
    }

    // A dependency-free module is served verbatim; the legacy wrapper is
    // always worker-built.
    if record.variant == Variant::Module && deps_empty {
        outcome.worker.lock().take();
        let mut state = record.state.lock();
        state.source = Some(source);
        state.source_map = None;
        return Ok(());
    }

    let worker = outcome.worker.lock().take();
    let worker = match worker {
        Some(worker) => worker,
        None => {
            shared
                .pool
                .assign(
                    &record.key,
                    source,
                    record.path.clone(),
                    shared.config.production,
                )
                .await?
        }
    };

    let resolve_map = outcome.resolve_map.clone().unwrap_or_default();
    let (transformed, source_map) = worker.transform(record.variant, &resolve_map).await?;
    debug!(path = %record.path, "transform complete");

    let mut state = record.state.lock();
    state.source = Some(transformed);
    state.source_map = source_map;
    Ok(())
}

/// Whether the file lives under a symlinked shared package cache: its
/// package root, if any, is a symlink.
async fn global_cache_probe(shared: Arc<Shared>, path: String) -> bool {
    let Some(package_root) = shared.resolver.package_path(&path).await else {
        return false;
    };
    match tokio::fs::symlink_metadata(&package_root).await {
        Ok(meta) => meta.file_type().is_symlink(),
        Err(_) => false,
    }
}
