//! Transform worker wire protocol and the engine trait boundary.
//!
//! Workers are opaque out-of-process peers speaking a strict
//! request/response protocol: one outstanding request per worker, every
//! reply matching the most recent request. The pairing is enforced by pool
//! bookkeeping ([`crate::pool::PooledWorker`] ownership), not by the wire.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// Mapping from raw import specifier to rewritten specifier. A `None` value
/// is the empty-module sentinel (serialized as `null`); absent entries mean
/// "keep the original specifier".
pub type ResolveMap = BTreeMap<String, Option<String>>;

/// Requests sent to a transform worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineRequest {
    /// Primes the worker with the source it will analyze or transform.
    Source {
        source: String,
        filename: String,
        production: bool,
    },
    AnalyzeModule,
    AnalyzeLegacy,
    TransformModule {
        #[serde(rename = "resolveMap")]
        resolve_map: ResolveMap,
    },
    TransformLegacy {
        #[serde(rename = "resolveMap")]
        resolve_map: ResolveMap,
    },
}

/// Replies from a transform worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineReply {
    Ok { data: ReplyData },
    Err { message: String },
}

/// Payloads of successful replies. Untagged: `deps` identifies an analyze
/// reply, `source` a transform reply; the empty acknowledgment of a
/// `source` priming message matches last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyData {
    Deps {
        deps: Vec<String>,
    },
    Transformed {
        source: String,
        #[serde(rename = "sourceMap")]
        source_map: Option<String>,
    },
    Ack {},
}

/// The boundary to an out-of-process transform worker.
///
/// Implementations own the process handle and the message transport; any
/// transport failure surfaces as [`EngineReply::Err`].
pub trait TransformEngine: Send + Sync {
    fn request(
        &self,
        request: EngineRequest,
    ) -> Pin<Box<dyn Future<Output = EngineReply> + Send + '_>>;
}
