//! Hash phase: source digest, dependency analysis, and the resolve map
//! whose rolling digest makes resolver state a cache input.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::Shared;
use crate::engine::ResolveMap;
use crate::error::Error;
use crate::pool::PooledWorker;
use crate::record::{Record, Variant, is_json_path, normalize_slashes};
use crate::resolver::{ModuleFormat, Resolution, ResolverFacade};

const EMPTY_SENTINEL: &str = "@empty";

/// Take-once slot carrying the worker a hash phase may have bound.
/// Whoever proceeds to the transform takes it; dropping the last clone
/// releases the worker back to the pool.
pub(crate) type WorkerSlot = Arc<Mutex<Option<PooledWorker>>>;

/// Result of a completed hash phase, broadcast to every coalesced caller.
#[derive(Clone)]
pub(crate) struct HashOutcome {
    pub full_hash: String,
    /// Absent for JSON sources, which have no dependencies to rewrite.
    pub resolve_map: Option<Arc<ResolveMap>>,
    pub worker: WorkerSlot,
}

pub(crate) fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

/// Runs one hash phase for `record`: digest the source, re-analyze
/// dependencies if it changed, rebuild the resolve map, and compose the
/// full hash.
pub(crate) async fn run(shared: &Arc<Shared>, record: &Arc<Record>) -> Result<HashOutcome, Error> {
    let (source, prev_source_hash, prev_deps) = {
        let state = record.state.lock();
        (
            state.original_source.clone().unwrap_or_default(),
            state.original_source_hash.clone(),
            state.deps.clone(),
        )
    };
    let source_hash = md5_hex(&source);

    // JSON needs no analysis and no resolve map; the source digest is the
    // whole story.
    if is_json_path(&record.path) {
        record.state.lock().full_hash = Some(source_hash.clone());
        return Ok(HashOutcome {
            full_hash: source_hash,
            resolve_map: None,
            worker: Arc::new(Mutex::new(None)),
        });
    }

    let mut worker = None;
    let deps = if prev_source_hash.as_deref() != Some(source_hash.as_str()) {
        let bound = shared
            .pool
            .assign(
                &record.key,
                source,
                record.path.clone(),
                shared.config.production,
            )
            .await?;
        let deps = bound.analyze(record.variant).await?;
        debug!(path = %record.path, deps = deps.len(), "analyzed dependencies");
        {
            let mut state = record.state.lock();
            state.deps = Some(deps.clone());
            state.original_source_hash = Some(source_hash.clone());
        }
        worker = Some(bound);
        deps
    } else {
        prev_deps.unwrap_or_default()
    };

    let (resolve_map, resolve_hash) = build_resolve_map(
        &shared.resolver,
        &shared.builtins,
        &shared.config.public_dir,
        &record.path,
        record.variant,
        &deps,
    )
    .await?;

    let full_hash = format!("{source_hash}{resolve_hash}");
    record.state.lock().full_hash = Some(full_hash.clone());

    Ok(HashOutcome {
        full_hash,
        resolve_map: Some(Arc::new(resolve_map)),
        worker: Arc::new(Mutex::new(worker)),
    })
}

/// Resolves every dependency and builds the specifier rewrite map plus its
/// rolling digest. An entry is emitted iff the rewritten specifier differs
/// from the original; the digest covers the full ordered sequence of
/// `(dep, resolved)` / `(dep, "@empty")` pairs either way.
pub(crate) async fn build_resolve_map(
    resolver: &ResolverFacade,
    builtins: &HashMap<String, Option<String>>,
    public_dir: &str,
    path: &str,
    variant: Variant,
    deps: &[String],
) -> Result<(ResolveMap, String), Error> {
    let base = dirname(path);
    let legacy = variant.is_legacy();
    let mut map = ResolveMap::new();
    let mut digest = md5::Context::new();

    for dep in deps {
        let resolution = resolver.resolve(dep, path, legacy).await?;
        let resolution = match resolution.format {
            ModuleFormat::Builtin => match builtins.get(&resolution.resolved) {
                Some(Some(substitute)) => Some(Resolution {
                    resolved: substitute.clone(),
                    format: ModuleFormat::Module,
                }),
                // Unlisted builtins substitute to the empty module.
                _ => None,
            },
            _ => Some(resolution),
        };

        let Some(resolution) = resolution else {
            map.insert(dep.clone(), None);
            digest.consume(dep.as_bytes());
            digest.consume(EMPTY_SENTINEL.as_bytes());
            continue;
        };

        let resolved = normalize_slashes(&resolution.resolved);
        let mut rel = relative(base, &resolved);
        if !rel.starts_with("../") {
            rel = format!("./{rel}");
        }
        if !resolved.starts_with(public_dir) {
            return Err(Error::transform(format!(
                "dependency {rel} of {path} resolves outside the public directory"
            )));
        }

        let suffix = if legacy {
            "?dew"
        } else if matches!(resolution.format, ModuleFormat::Legacy | ModuleFormat::Json) {
            "?cjs"
        } else {
            ""
        };
        let rewritten = format!("{rel}{suffix}");
        if *dep != rewritten {
            map.insert(dep.clone(), Some(rewritten));
        }

        digest.consume(dep.as_bytes());
        digest.consume(resolved.as_bytes());
    }

    Ok((map, format!("{:x}", digest.compute())))
}

pub(crate) fn dirname(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Relative path from directory `base` to file `target`, forward slashes,
/// both absolute.
fn relative(base: &str, target: &str) -> String {
    let base_parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    let target_parts: Vec<&str> = target.split('/').filter(|p| !p.is_empty()).collect();
    let common = base_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    for _ in common..base_parts.len() {
        parts.push("..");
    }
    parts.extend(target_parts[common..].iter().copied());
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{FormatOpts, ModuleResolver, ResolveOpts, ResolverCache, ResolverFuture};
    use std::time::Duration;

    #[test]
    fn test_md5_hex_known_digest() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_relative_paths() {
        assert_eq!(relative("/pub", "/pub/b.js"), "b.js");
        assert_eq!(relative("/pub/sub", "/pub/b.js"), "../b.js");
        assert_eq!(relative("/pub", "/pub/nested/c.js"), "nested/c.js");
        assert_eq!(relative("/pub/a/b", "/other/c.js"), "../../../other/c.js");
    }

    struct StaticResolver {
        resolutions: HashMap<String, Resolution>,
    }

    impl ModuleResolver for StaticResolver {
        fn resolve(
            &self,
            specifier: &str,
            _parent: &str,
            _opts: ResolveOpts,
        ) -> ResolverFuture<Result<Resolution, Error>> {
            let result = self.resolutions.get(specifier).cloned().ok_or_else(|| {
                Error::Resolve {
                    message: format!("cannot resolve {specifier}"),
                }
            });
            Box::pin(async move { result })
        }

        fn format(
            &self,
            _path: &str,
            _opts: FormatOpts,
        ) -> ResolverFuture<Result<ModuleFormat, Error>> {
            Box::pin(async { Ok(ModuleFormat::Module) })
        }

        fn package_path(
            &self,
            _path: &str,
            _cache: Arc<ResolverCache>,
        ) -> ResolverFuture<Option<String>> {
            Box::pin(async { None })
        }
    }

    fn facade_over(resolutions: HashMap<String, Resolution>) -> ResolverFacade {
        ResolverFacade::new(
            Arc::new(StaticResolver { resolutions }),
            false,
            Duration::from_secs(5),
        )
    }

    fn module_at(path: &str) -> Resolution {
        Resolution {
            resolved: path.into(),
            format: ModuleFormat::Module,
        }
    }

    #[tokio::test]
    async fn test_rewrite_and_hash_composition() {
        let facade = facade_over(HashMap::from([("b".to_string(), module_at("/pub/b.js"))]));
        let (map, hash) = build_resolve_map(
            &facade,
            &HashMap::new(),
            "/pub/",
            "/pub/a.js",
            Variant::Module,
            &["b".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(map.get("b"), Some(&Some("./b.js".to_string())));

        let mut expected = md5::Context::new();
        expected.consume(b"b");
        expected.consume(b"/pub/b.js");
        assert_eq!(hash, format!("{:x}", expected.compute()));
    }

    #[tokio::test]
    async fn test_identity_resolution_not_emitted() {
        let facade = facade_over(HashMap::from([(
            "./b.js".to_string(),
            module_at("/pub/b.js"),
        )]));
        let (map, hash) = build_resolve_map(
            &facade,
            &HashMap::new(),
            "/pub/",
            "/pub/a.js",
            Variant::Module,
            &["./b.js".to_string()],
        )
        .await
        .unwrap();

        assert!(map.is_empty());
        // The digest still covers the resolution.
        let mut expected = md5::Context::new();
        expected.consume(b"./b.js");
        expected.consume(b"/pub/b.js");
        assert_eq!(hash, format!("{:x}", expected.compute()));
    }

    #[tokio::test]
    async fn test_legacy_and_cjs_suffixes() {
        let legacy_dep = Resolution {
            resolved: "/pub/c.js".into(),
            format: ModuleFormat::Legacy,
        };
        let facade = facade_over(HashMap::from([
            ("b".to_string(), module_at("/pub/b.js")),
            ("c".to_string(), legacy_dep),
        ]));

        // Legacy records suffix every rewrite with ?dew.
        let (map, _) = build_resolve_map(
            &facade,
            &HashMap::new(),
            "/pub/",
            "/pub/a.js",
            Variant::Legacy,
            &["b".to_string(), "c".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(map.get("b"), Some(&Some("./b.js?dew".to_string())));
        assert_eq!(map.get("c"), Some(&Some("./c.js?dew".to_string())));

        // Module records suffix only legacy/JSON-format deps, with ?cjs.
        let (map, _) = build_resolve_map(
            &facade,
            &HashMap::new(),
            "/pub/",
            "/pub/a.js",
            Variant::Module,
            &["b".to_string(), "c".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(map.get("b"), Some(&Some("./b.js".to_string())));
        assert_eq!(map.get("c"), Some(&Some("./c.js?cjs".to_string())));
    }

    #[tokio::test]
    async fn test_builtin_substitution() {
        let facade = facade_over(HashMap::from([
            (
                "fs".to_string(),
                Resolution {
                    resolved: "fs".into(),
                    format: ModuleFormat::Builtin,
                },
            ),
            (
                "buffer".to_string(),
                Resolution {
                    resolved: "buffer".into(),
                    format: ModuleFormat::Builtin,
                },
            ),
        ]));
        let builtins = HashMap::from([
            ("fs".to_string(), None),
            (
                "buffer".to_string(),
                Some("/pub/shims/buffer.js".to_string()),
            ),
        ]);

        let (map, hash) = build_resolve_map(
            &facade,
            &builtins,
            "/pub/",
            "/pub/a.js",
            Variant::Module,
            &["fs".to_string(), "buffer".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(map.get("fs"), Some(&None));
        assert_eq!(map.get("buffer"), Some(&Some("./shims/buffer.js".to_string())));

        let mut expected = md5::Context::new();
        expected.consume(b"fs");
        expected.consume(b"@empty");
        expected.consume(b"buffer");
        expected.consume(b"/pub/shims/buffer.js");
        assert_eq!(hash, format!("{:x}", expected.compute()));
    }

    #[tokio::test]
    async fn test_outside_public_dir_rejected() {
        let facade = facade_over(HashMap::from([("c".to_string(), module_at("/other/c.js"))]));
        let err = build_resolve_map(
            &facade,
            &HashMap::new(),
            "/pub/",
            "/pub/a.js",
            Variant::Module,
            &["c".to_string()],
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), Some("transform-error"));
        assert!(err.to_string().contains("../other/c.js"));
    }
}
