//! Bounded filesystem watches with an mtime-probe fallback.

use std::io::ErrorKind;
use std::path::Path;
use std::time::UNIX_EPOCH;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Error;
use crate::record::MISSING_MTIME;

/// Change notifications carry the record-store key, never the record;
/// the event loop looks the record up at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WatchEvent {
    /// Contents changed; the record must re-read and re-hash.
    Changed(String),
    /// Renamed or removed; the record falls back to mtime probing.
    Gone(String),
}

struct WatchSlot {
    key: String,
    _watcher: RecommendedWatcher,
}

/// Holds up to `max` single-file watchers keyed by record-store key.
pub(crate) struct WatchManager {
    max: usize,
    tx: mpsc::Sender<WatchEvent>,
    watching: Mutex<Vec<WatchSlot>>,
}

impl WatchManager {
    pub(crate) fn new(max: usize) -> (Self, mpsc::Receiver<WatchEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (
            WatchManager {
                max,
                tx,
                watching: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Opens a watch for `path` under `key` if the watch budget allows it.
    /// Returns false when at capacity or when the watch cannot be opened;
    /// the caller then falls back to mtime probing.
    pub(crate) fn try_watch(&self, key: &str, path: &str) -> bool {
        let mut watching = self.watching.lock();
        if watching.len() >= self.max {
            return false;
        }

        let tx = self.tx.clone();
        let event_key = key.to_string();
        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            let event = match event.kind {
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                    WatchEvent::Gone(event_key.clone())
                }
                EventKind::Create(_) | EventKind::Modify(_) => {
                    WatchEvent::Changed(event_key.clone())
                }
                _ => return,
            };
            // Dropped events are caught by the next request's mtime probe.
            let _ = tx.try_send(event);
        });

        let Ok(mut watcher) = watcher else {
            return false;
        };
        if watcher
            .watch(Path::new(path), RecursiveMode::NonRecursive)
            .is_err()
        {
            return false;
        }

        info!(path, "started watching");
        watching.push(WatchSlot {
            key: key.to_string(),
            _watcher: watcher,
        });
        true
    }

    /// Closes and unlists the watch for `key`, freeing its budget slot.
    pub(crate) fn unwatch(&self, key: &str) {
        let mut watching = self.watching.lock();
        let before = watching.len();
        watching.retain(|slot| slot.key != key);
        if watching.len() != before {
            debug!(key, "stopped watching");
        }
    }

    pub(crate) fn close_all(&self) {
        self.watching.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> usize {
        self.watching.lock().len()
    }
}

/// Probes a file's mtime in epoch milliseconds. Missing or unreadable
/// files report [`MISSING_MTIME`]; any other failure propagates.
pub(crate) async fn probe_mtime(path: &str) -> Result<i64, Error> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => {
            let modified = meta.modified().map_err(Error::io)?;
            Ok(modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0))
        }
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
            Ok(MISSING_MTIME)
        }
        Err(err) => Err(Error::io(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_probe_mtime_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.js");
        assert_eq!(
            probe_mtime(path.to_str().unwrap()).await.unwrap(),
            MISSING_MTIME
        );
    }

    #[tokio::test]
    async fn test_probe_mtime_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.js");
        std::fs::write(&path, "let x;").unwrap();
        assert!(probe_mtime(path.to_str().unwrap()).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_watch_budget_cap() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.js");
        let b = dir.path().join("b.js");
        std::fs::write(&a, "").unwrap();
        std::fs::write(&b, "").unwrap();

        let (manager, _rx) = WatchManager::new(1);
        assert!(manager.try_watch("a", a.to_str().unwrap()));
        assert!(!manager.try_watch("b", b.to_str().unwrap()));
        assert_eq!(manager.count(), 1);

        manager.unwatch("a");
        assert!(manager.try_watch("b", b.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_change_event_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.js");
        std::fs::write(&path, "one").unwrap();

        let (manager, mut rx) = WatchManager::new(8);
        assert!(manager.try_watch("a.js", path.to_str().unwrap()));

        std::fs::write(&path, "two").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no watch event within timeout")
            .expect("watch channel closed");
        assert_eq!(event, WatchEvent::Changed("a.js".into()));
    }
}
