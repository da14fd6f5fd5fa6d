//! Request coordinator: the public cache surface and the per-record state
//! machine driving hash and transform phases.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::TransformEngine;
use crate::error::Error;
use crate::hash::{self, HashOutcome};
use crate::pool::WorkerPool;
use crate::record::{
    PhaseHandle, Record, RecordState, RecordStore, Variant, normalize_slashes, now_millis,
    record_key,
};
use crate::resolver::{ModuleFormat, ModuleResolver, Resolution, ResolverFacade};
use crate::transform;
use crate::watch::{WatchEvent, WatchManager, probe_mtime};

/// State shared between the coordinator, phase tasks, and the event loop.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) resolver: ResolverFacade,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) records: RecordStore,
    pub(crate) watches: WatchManager,
    pub(crate) builtins: HashMap<String, Option<String>>,
}

/// A completed (or revalidated) transform.
///
/// `source`/`source_map` are `None` on a not-modified reply, with the hash
/// echoed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult {
    pub source: Option<String>,
    pub source_map: Option<String>,
    pub hash: String,
    pub is_global_cache: bool,
}

/// Incremental file-transform cache fronting a module resolver and a pool
/// of out-of-process transform workers.
///
/// Must be constructed inside a tokio runtime; the resolver-cache clear
/// timer and the watch event loop are spawned at construction.
pub struct TransformCache {
    shared: Arc<Shared>,
    clear_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl TransformCache {
    /// Builds a cache with one worker per unit of available parallelism.
    pub fn new<F>(
        config: Config,
        resolver: Arc<dyn ModuleResolver>,
        builtins: HashMap<String, Option<String>>,
        mut spawn_engine: F,
    ) -> Self
    where
        F: FnMut() -> Arc<dyn TransformEngine>,
    {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let engines = (0..workers).map(|_| spawn_engine()).collect();
        Self::with_workers(config, resolver, builtins, engines)
    }

    /// Builds a cache over an explicit set of workers.
    pub fn with_workers(
        config: Config,
        resolver: Arc<dyn ModuleResolver>,
        builtins: HashMap<String, Option<String>>,
        engines: Vec<Arc<dyn TransformEngine>>,
    ) -> Self {
        let config = config.normalized();
        let (watches, event_rx) = WatchManager::new(config.max_watch_count);
        let resolver = ResolverFacade::new(resolver, config.production, config.cache_clear_interval);
        let shared = Arc::new(Shared {
            resolver,
            pool: WorkerPool::new(engines),
            records: RecordStore::default(),
            watches,
            builtins,
            config,
        });

        let clear_interval = shared.config.cache_clear_interval;
        let clear_shared = shared.clone();
        let clear_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(clear_interval).await;
                clear_shared.resolver.clear_cache(clear_interval);
            }
        });
        let event_task = tokio::spawn(event_loop(shared.clone(), event_rx));

        TransformCache {
            shared,
            clear_task: Mutex::new(Some(clear_task)),
            event_task: Mutex::new(Some(event_task)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Returns the transformed source, source map, and content hash for
    /// `file_path`, transforming only what the current input graph
    /// requires. A `?dew` suffix selects the legacy variant.
    ///
    /// `Ok(None)` means this variant needs no transform and the caller
    /// should request the sibling variant. A `known_hash` matching the
    /// current full hash short-circuits to a not-modified reply.
    pub async fn get(
        &self,
        file_path: &str,
        known_hash: Option<&str>,
    ) -> Result<Option<TransformResult>, Error> {
        let (raw_path, variant) = Variant::split(file_path);
        let path = normalize_slashes(raw_path);
        let key = record_key(&path, variant);

        let entry = self.shared.records.entry(&key);
        let record = entry
            .get_or_try_init(|| create_record(&self.shared, &path, variant, &key))
            .await?
            .clone();
        let Some(record) = record else {
            return Ok(None);
        };

        drive(&self.shared, &record, known_hash).await
    }

    /// Resolver pass-through with trailing-`/` stripping.
    pub async fn resolve(
        &self,
        name: &str,
        parent: &str,
        legacy: bool,
    ) -> Result<Resolution, Error> {
        self.shared.resolver.resolve(name, parent, legacy).await
    }

    /// Resolver format pass-through.
    pub async fn format(&self, path: &str, legacy: bool) -> Result<ModuleFormat, Error> {
        self.shared.resolver.format(path, legacy).await
    }

    /// Idempotent teardown: stops the clear timer and event loop and
    /// closes every watcher. In-flight phases run to completion.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.clear_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.shared.watches.close_all();
        info!("transform cache disposed");
    }
}

impl Drop for TransformCache {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// First-request path: read source and resolver format in parallel, check
/// the format against the requested variant, then materialize the record
/// and arrange freshness tracking.
async fn create_record(
    shared: &Arc<Shared>,
    path: &str,
    variant: Variant,
    key: &str,
) -> Result<Option<Arc<Record>>, Error> {
    let (read, format) = tokio::join!(
        tokio::fs::read_to_string(path),
        shared.resolver.format(path, variant.is_legacy())
    );

    let format = format?;
    match variant {
        Variant::Legacy => {
            if !matches!(format, ModuleFormat::Legacy | ModuleFormat::Json) {
                return Err(Error::NoTransform {
                    path: path.to_string(),
                });
            }
        }
        Variant::Module => match format {
            ModuleFormat::Module => {}
            // The caller rewrites its specifier to the sibling variant.
            ModuleFormat::Json | ModuleFormat::Legacy => return Ok(None),
            ModuleFormat::Builtin | ModuleFormat::Unknown => {
                return Err(Error::UnsupportedFormat {
                    path: path.to_string(),
                });
            }
        },
    }

    let source = match read {
        Ok(source) => source,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }
        Err(err) => return Err(Error::io(err)),
    };

    let record = Arc::new(Record::new(
        key.to_string(),
        path.to_string(),
        variant,
        source,
    ));
    if shared.watches.try_watch(key, path) {
        record.state.lock().watched = true;
    } else {
        let mtime = probe_mtime(path).await?;
        record.state.lock().mtime = Some(mtime);
    }
    record.state.lock().check_time = now_millis();
    debug!(key, "record created");
    Ok(Some(record))
}

enum Step {
    AwaitTransform(PhaseHandle<()>),
    AwaitHash(PhaseHandle<HashOutcome>),
    Fresh,
}

#[derive(PartialEq)]
enum Freshness {
    Current,
    Collapsed,
}

/// The per-record state machine on `(hash_pending, transform_pending)`.
async fn drive(
    shared: &Arc<Shared>,
    record: &Arc<Record>,
    known_hash: Option<&str>,
) -> Result<Option<TransformResult>, Error> {
    let step = {
        let state = record.state.lock();
        if let Some(pending) = &state.hash_pending {
            Step::AwaitHash(pending.clone())
        } else if let Some(pending) = &state.transform_pending {
            if hash_matches(known_hash, state.full_hash.as_deref()) {
                return Ok(Some(not_modified(&state)));
            }
            Step::AwaitTransform(pending.clone())
        } else {
            Step::Fresh
        }
    };

    match step {
        Step::AwaitTransform(pending) => {
            pending.wait().await?;
            Ok(Some(completed(record)))
        }
        Step::AwaitHash(pending) => {
            let outcome = pending.wait().await?;
            after_hash(shared, record, outcome, known_hash).await
        }
        Step::Fresh => {
            if refresh(shared, record).await? == Freshness::Collapsed {
                return Ok(None);
            }
            let outcome = start_hash(shared, record).wait().await?;
            after_hash(shared, record, outcome, known_hash).await
        }
    }
}

/// Continues a request once the hash generation is known: either echo a
/// matching known hash, join the in-flight transform, or drive one.
async fn after_hash(
    shared: &Arc<Shared>,
    record: &Arc<Record>,
    outcome: HashOutcome,
    known_hash: Option<&str>,
) -> Result<Option<TransformResult>, Error> {
    if hash_matches(known_hash, Some(&outcome.full_hash)) {
        // Nothing to transform; release the analysis worker.
        outcome.worker.lock().take();
        let is_global_cache = record.state.lock().is_global_cache;
        return Ok(Some(TransformResult {
            source: None,
            source_map: None,
            hash: outcome.full_hash,
            is_global_cache,
        }));
    }

    let pending = record.state.lock().transform_pending.clone();
    let pending = match pending {
        Some(pending) => pending,
        None => start_transform(shared, record, outcome),
    };
    pending.wait().await?;
    Ok(Some(completed(record)))
}

/// Freshness check for settled, unwatched records: probe the mtime and
/// re-read the source if it moved. Disappearance collapses the store
/// entry to absent.
async fn refresh(shared: &Arc<Shared>, record: &Arc<Record>) -> Result<Freshness, Error> {
    let (watched, check_time, last_mtime) = {
        let state = record.state.lock();
        (state.watched, state.check_time, state.mtime)
    };
    if watched || check_time >= shared.resolver.next_expiry() {
        return Ok(Freshness::Current);
    }

    let probed = probe_mtime(&record.path).await?;
    {
        let mut state = record.state.lock();
        state.check_time = now_millis();
        state.mtime = Some(probed);
    }
    if last_mtime == Some(probed) {
        return Ok(Freshness::Current);
    }

    match tokio::fs::read_to_string(&record.path).await {
        Ok(source) => {
            debug!(path = %record.path, "source re-read after mtime change");
            let mut state = record.state.lock();
            state.original_source = Some(source);
            // A settled transform (JSON's permanent handle included) no
            // longer reflects the re-read source.
            if state.transform_pending.as_ref().is_some_and(|p| p.is_done()) {
                state.transform_pending = None;
            }
            Ok(Freshness::Current)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            shared.watches.unwatch(&record.key);
            shared.records.collapse(&record.key);
            Ok(Freshness::Collapsed)
        }
        Err(err) => Err(Error::io(err)),
    }
}

/// Starts a hash phase unless one is already in flight, returning the
/// handle every concurrent caller subscribes to. The completed phase
/// stays visible for one clear interval before the deferred cleanup
/// re-opens freshness checking.
fn start_hash(shared: &Arc<Shared>, record: &Arc<Record>) -> PhaseHandle<HashOutcome> {
    let mut state = record.state.lock();
    if let Some(pending) = &state.hash_pending {
        return pending.clone();
    }
    state.phase_generation += 1;
    let generation = state.phase_generation;
    let (sender, handle) = PhaseHandle::channel();
    state.hash_pending = Some(handle.clone());
    drop(state);

    let shared = shared.clone();
    let record = record.clone();
    tokio::spawn(async move {
        let result = hash::run(&shared, &record).await;
        if let Err(err) = &result {
            debug!(path = %record.path, %err, "hash phase failed");
        }
        sender.complete(result);

        tokio::time::sleep(shared.config.cache_clear_interval).await;
        let mut state = record.state.lock();
        if state.phase_generation == generation {
            state.hash_pending = None;
        }
    });
    handle
}

/// Starts a transform phase unless one is already in flight. A failed
/// transform clears the analyzed source hash so the next hash phase
/// re-analyzes.
fn start_transform(
    shared: &Arc<Shared>,
    record: &Arc<Record>,
    outcome: HashOutcome,
) -> PhaseHandle<()> {
    let mut state = record.state.lock();
    if let Some(pending) = &state.transform_pending {
        return pending.clone();
    }
    let (sender, handle) = PhaseHandle::channel();
    state.transform_pending = Some(handle.clone());
    drop(state);

    let shared = shared.clone();
    let record = record.clone();
    tokio::spawn(async move {
        let result = transform::run(shared, record.clone(), outcome).await;
        if let Err(err) = &result {
            debug!(path = %record.path, %err, "transform phase failed");
            record.state.lock().original_source_hash = None;
        }
        sender.complete(result);
    });
    handle
}

async fn event_loop(shared: Arc<Shared>, mut events: mpsc::Receiver<WatchEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            WatchEvent::Changed(key) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_change(shared, key).await;
                });
            }
            WatchEvent::Gone(key) => handle_gone(&shared, &key),
        }
    }
}

/// Watch-event re-entry: re-read the source, let in-flight phases settle,
/// re-hash, and retransform only if the full hash moved.
async fn handle_change(shared: Arc<Shared>, key: String) {
    let Some(record) = shared.records.get_ready(&key) else {
        return;
    };
    debug!(path = %record.path, "file changed");

    match tokio::fs::read_to_string(&record.path).await {
        Ok(source) => record.state.lock().original_source = Some(source),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            shared.watches.unwatch(&key);
            shared.records.collapse(&key);
            return;
        }
        Err(err) => {
            warn!(path = %record.path, %err, "re-read after change failed");
            return;
        }
    }

    let (previous_hash, hash_pending, transform_pending) = {
        let state = record.state.lock();
        (
            state.full_hash.clone(),
            state.hash_pending.clone(),
            state.transform_pending.clone(),
        )
    };
    if let Some(pending) = hash_pending {
        let _ = pending.wait().await;
    }
    if let Some(pending) = transform_pending {
        let _ = pending.wait().await;
    }

    // Settled handles are displaced so the phases re-run against the new
    // source; an in-flight phase started meanwhile is joined instead.
    {
        let mut state = record.state.lock();
        if state.hash_pending.as_ref().is_some_and(|p| p.is_done()) {
            state.hash_pending = None;
        }
    }
    let outcome = match start_hash(&shared, &record).wait().await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(path = %record.path, %err, "re-hash after change failed");
            return;
        }
    };

    if previous_hash.as_deref() == Some(outcome.full_hash.as_str()) {
        // Same composite hash; nothing to retransform.
        outcome.worker.lock().take();
        return;
    }

    {
        let mut state = record.state.lock();
        if state.transform_pending.as_ref().is_some_and(|p| p.is_done()) {
            state.transform_pending = None;
        }
    }
    let _ = start_transform(&shared, &record, outcome).wait().await;
}

/// Rename/remove: close the watch and fall back to mtime probing.
fn handle_gone(shared: &Arc<Shared>, key: &str) {
    shared.watches.unwatch(key);
    if let Some(record) = shared.records.get_ready(key) {
        debug!(path = %record.path, "watch lost, probing mtime from now on");
        let mut state = record.state.lock();
        state.watched = false;
        state.check_time = now_millis();
    }
}

fn hash_matches(known: Option<&str>, full: Option<&str>) -> bool {
    known.is_some() && known == full
}

fn not_modified(state: &RecordState) -> TransformResult {
    TransformResult {
        source: None,
        source_map: None,
        hash: state.full_hash.clone().unwrap_or_default(),
        is_global_cache: state.is_global_cache,
    }
}

fn completed(record: &Record) -> TransformResult {
    let state = record.state.lock();
    TransformResult {
        source: state.source.clone(),
        source_map: state.source_map.clone(),
        hash: state.full_hash.clone().unwrap_or_default(),
        is_global_cache: state.is_global_cache,
    }
}
