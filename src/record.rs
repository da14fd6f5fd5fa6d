//! Per-file cache records, phase coalescing handles, and the record store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{OnceCell, watch};

use crate::error::Error;
use crate::hash::HashOutcome;

/// Mtime sentinel for a file that is missing or unreadable.
pub(crate) const MISSING_MTIME: i64 = -1;

/// Which transform a record represents. Different variants of the same
/// file are distinct records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Module,
    Legacy,
}

impl Variant {
    /// Splits an incoming request path into the filesystem path and the
    /// variant selected by its `?dew` suffix.
    pub(crate) fn split(file_path: &str) -> (&str, Variant) {
        match file_path.strip_suffix("?dew") {
            Some(path) => (path, Variant::Legacy),
            None => (file_path, Variant::Module),
        }
    }

    /// The record-store key suffix for this variant.
    pub(crate) fn suffix(self) -> &'static str {
        match self {
            Variant::Module => "",
            Variant::Legacy => "?dew",
        }
    }

    pub(crate) fn is_legacy(self) -> bool {
        matches!(self, Variant::Legacy)
    }
}

pub(crate) fn record_key(path: &str, variant: Variant) -> String {
    format!("{path}{}", variant.suffix())
}

pub(crate) fn normalize_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

pub(crate) fn is_json_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Single-shot broadcast of a phase result. Cloning subscribes; the phase
/// task resolves it exactly once through the paired [`PhaseSender`].
#[derive(Clone)]
pub(crate) struct PhaseHandle<T> {
    rx: watch::Receiver<Option<Result<T, Error>>>,
}

pub(crate) struct PhaseSender<T> {
    tx: watch::Sender<Option<Result<T, Error>>>,
}

impl<T: Clone> PhaseHandle<T> {
    pub(crate) fn channel() -> (PhaseSender<T>, PhaseHandle<T>) {
        let (tx, rx) = watch::channel(None);
        (PhaseSender { tx }, PhaseHandle { rx })
    }

    /// Waits for the phase to resolve and returns its (shared) result.
    pub(crate) async fn wait(&self) -> Result<T, Error> {
        let mut rx = self.rx.clone();
        let resolved = rx
            .wait_for(|value| value.is_some())
            .await
            .map_err(|_| Error::transform("phase abandoned before completion"))?;
        match resolved.clone() {
            Some(result) => result,
            None => Err(Error::transform("phase abandoned before completion")),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

impl<T> PhaseSender<T> {
    pub(crate) fn complete(self, result: Result<T, Error>) {
        self.tx.send_replace(Some(result));
    }
}

/// One cache entry per `(path, variant)`.
pub(crate) struct Record {
    pub key: String,
    pub path: String,
    pub variant: Variant,
    pub state: Mutex<RecordState>,
}

#[derive(Default)]
pub(crate) struct RecordState {
    /// Current file text.
    pub original_source: Option<String>,
    /// Hash of `original_source` when dependencies were last analyzed.
    pub original_source_hash: Option<String>,
    /// Raw specifiers from the last analysis.
    pub deps: Option<Vec<String>>,
    /// `source_hash ++ resolve_map_hash`, the externally visible hash.
    pub full_hash: Option<String>,
    /// Last transform output.
    pub source: Option<String>,
    pub source_map: Option<String>,
    /// Last observed mtime in epoch millis; [`MISSING_MTIME`] if missing.
    pub mtime: Option<i64>,
    /// Whether the file's package root is a symlinked shared cache.
    pub is_global_cache: bool,
    /// Wall time (epoch millis) of the last freshness check.
    pub check_time: u64,
    /// True iff a filesystem watcher is active for this record.
    pub watched: bool,
    pub hash_pending: Option<PhaseHandle<HashOutcome>>,
    pub transform_pending: Option<PhaseHandle<()>>,
    /// Bumped whenever a hash phase starts; lets the deferred cleanup
    /// clear only its own generation.
    pub phase_generation: u64,
}

impl Record {
    pub(crate) fn new(key: String, path: String, variant: Variant, source: String) -> Self {
        Record {
            key,
            path,
            variant,
            state: Mutex::new(RecordState {
                original_source: Some(source),
                ..RecordState::default()
            }),
        }
    }
}

/// A store entry resolves to the record, or to `None` for requests that
/// need no transform ("request the sibling variant"), and coalesces
/// concurrent first requests through the `OnceCell`.
pub(crate) type StoreEntry = Arc<OnceCell<Option<Arc<Record>>>>;

/// Mapping from `path ++ variant_suffix` to shared record handles. Entries
/// are never removed during normal operation; deletion of the underlying
/// file collapses the entry to absent instead.
#[derive(Default)]
pub(crate) struct RecordStore {
    map: Mutex<HashMap<String, StoreEntry>>,
}

impl RecordStore {
    pub(crate) fn entry(&self, key: &str) -> StoreEntry {
        self.map
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// The record for `key` if one has fully materialized.
    pub(crate) fn get_ready(&self, key: &str) -> Option<Arc<Record>> {
        let entry = self.map.lock().get(key).cloned()?;
        entry.get().cloned().flatten()
    }

    /// Replaces the entry with a resolved-absent handle; subsequent
    /// requests short-circuit until the key is requested fresh again.
    pub(crate) fn collapse(&self, key: &str) {
        self.map
            .lock()
            .insert(key.to_string(), Arc::new(OnceCell::new_with(Some(None))));
    }
}
