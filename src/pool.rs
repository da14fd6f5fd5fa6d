//! Worker pool: long-lived transform engines handed out one requester at a
//! time, with a strict-FIFO wait queue when all are busy.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::engine::{EngineReply, EngineRequest, ReplyData, ResolveMap, TransformEngine};
use crate::error::Error;
use crate::record::Variant;

pub(crate) struct WorkerPool {
    state: Mutex<PoolState>,
}

struct PoolState {
    idle: Vec<Arc<dyn TransformEngine>>,
    waiters: VecDeque<oneshot::Sender<Arc<dyn TransformEngine>>>,
}

impl WorkerPool {
    pub(crate) fn new(engines: Vec<Arc<dyn TransformEngine>>) -> Arc<Self> {
        debug!(workers = engines.len(), "worker pool started");
        Arc::new(WorkerPool {
            state: Mutex::new(PoolState {
                idle: engines,
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Binds an idle worker to a record, queueing FIFO behind earlier
    /// waiters when none is idle, and primes it with the record's source.
    pub(crate) async fn assign(
        self: &Arc<Self>,
        record_key: &str,
        source: String,
        filename: String,
        production: bool,
    ) -> Result<PooledWorker, Error> {
        let engine = {
            let mut state = self.state.lock();
            match state.idle.pop() {
                Some(engine) => Ok(engine),
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Err(rx)
                }
            }
        };

        let engine = match engine {
            Ok(engine) => engine,
            Err(rx) => {
                debug!(record = record_key, "waiting for a worker");
                rx.await
                    .map_err(|_| Error::transform("worker pool shut down"))?
            }
        };

        let worker = PooledWorker {
            engine: Some(engine),
            pool: self.clone(),
            record_key: record_key.to_string(),
        };

        // Prime before handing out; the engine ignores the ack payload.
        worker
            .request(EngineRequest::Source {
                source,
                filename,
                production,
            })
            .await?;
        debug!(record = record_key, "worker bound");
        Ok(worker)
    }

    /// Returns an engine to the pool, handing it to the oldest waiter if
    /// one is queued.
    fn release(&self, mut engine: Arc<dyn TransformEngine>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(engine) {
                Ok(()) => {
                    debug!("worker handed to queued waiter");
                    return;
                }
                // Waiter gave up; try the next one.
                Err(returned) => engine = returned,
            }
        }
        state.idle.push(engine);
    }
}

/// An engine bound to one record with at most one outstanding message.
/// Dropping it returns the engine to the pool.
pub(crate) struct PooledWorker {
    engine: Option<Arc<dyn TransformEngine>>,
    pool: Arc<WorkerPool>,
    pub(crate) record_key: String,
}

impl std::fmt::Debug for PooledWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWorker")
            .field("record_key", &self.record_key)
            .finish()
    }
}

impl PooledWorker {
    async fn request(&self, request: EngineRequest) -> Result<ReplyData, Error> {
        let Some(engine) = &self.engine else {
            return Err(Error::transform("worker already released"));
        };
        match engine.request(request).await {
            EngineReply::Ok { data } => Ok(data),
            EngineReply::Err { message } => {
                warn!(record = %self.record_key, %message, "worker rejected request");
                Err(Error::Transform { message })
            }
        }
    }

    /// `analyze-module` / `analyze-legacy` round trip.
    pub(crate) async fn analyze(&self, variant: Variant) -> Result<Vec<String>, Error> {
        let request = match variant {
            Variant::Module => EngineRequest::AnalyzeModule,
            Variant::Legacy => EngineRequest::AnalyzeLegacy,
        };
        match self.request(request).await? {
            ReplyData::Deps { deps } => Ok(deps),
            other => Err(Error::transform(format!(
                "unexpected analyze reply: {other:?}"
            ))),
        }
    }

    /// `transform-module` / `transform-legacy` round trip.
    pub(crate) async fn transform(
        &self,
        variant: Variant,
        resolve_map: &ResolveMap,
    ) -> Result<(String, Option<String>), Error> {
        let resolve_map = resolve_map.clone();
        let request = match variant {
            Variant::Module => EngineRequest::TransformModule { resolve_map },
            Variant::Legacy => EngineRequest::TransformLegacy { resolve_map },
        };
        match self.request(request).await? {
            ReplyData::Transformed { source, source_map } => Ok((source, source_map)),
            other => Err(Error::transform(format!(
                "unexpected transform reply: {other:?}"
            ))),
        }
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.pool.release(engine);
        }
    }
}
