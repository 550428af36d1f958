use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{SweepOptions, result};
use crate::cache::CacheObject;
use crate::metrics;
use crate::proxy::ProxyContext;
use crate::proxy::location::network_path;
use crate::store::{Descriptor, Record, Resource};

const PASS: &str = "descriptors";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptorReport {
    pub checked: usize,
    pub valid: usize,
    pub invalid: usize,
    pub multi_owner: usize,
    pub removed: usize,
    pub kept: usize,
    pub failed: usize,
    pub bytes_reclaimed: u64,
}

/// Why a descriptor failed validation.
#[derive(Debug, Error, PartialEq, Eq)]
enum Defect {
    #[error("owning resource is gone")]
    NoResource,
    #[error("cannot derive a cache key from '{url}': {reason}")]
    Unresolvable { url: String, reason: String },
    #[error("missing {0}")]
    Missing(String),
    #[error("missing content length of {0}")]
    NoContentLength(String),
    #[error("corrupt file {path}: size should be {expected}, found {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
}

/// Validates every descriptor against the object its resource URL maps to.
/// With pruning on, failing objects are deleted unless they exceed the prune
/// ceiling, and their descriptors are removed.
pub async fn check_cache(ctx: &ProxyContext, options: &SweepOptions) -> Result<DescriptorReport> {
    let descriptors = ctx
        .store
        .descriptors()
        .context("failed to list descriptors")?;
    let mut report = DescriptorReport::default();
    metrics::record_sweep_run(PASS);
    info!(count = descriptors.len(), prune = options.prune, "iterating descriptors");

    for record in descriptors {
        report.checked += 1;
        let outcome = match check_descriptor(ctx, options, &record, &mut report).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, path = %record.path, "failed to check descriptor");
                report.failed += 1;
                result::FAILED
            }
        };
        metrics::record_sweep_entry(PASS, outcome);
    }

    metrics::record_sweep_reclaimed(report.bytes_reclaimed);
    info!(
        checked = report.checked,
        valid = report.valid,
        invalid = report.invalid,
        removed = report.removed,
        "finished checking cache descriptors"
    );
    Ok(report)
}

async fn check_descriptor(
    ctx: &ProxyContext,
    options: &SweepOptions,
    record: &Record<Descriptor>,
    report: &mut DescriptorReport,
) -> Result<&'static str> {
    let owners = ctx.store.owners(&record.path)?;
    if owners.len() > 1 {
        warn!(path = %record.path, owners = ?owners, "multiple references");
        report.multi_owner += 1;
        return Ok(result::MULTI_OWNER);
    }

    let mut cache = match bind_expected(ctx, record).await? {
        Ok(cache) => cache,
        Err(defect) => {
            warn!(path = %record.path, defect = %defect, "invalid descriptor");
            report.invalid += 1;
            return remove_descriptor(ctx, options, record, None, report).await;
        }
    };
    match validate(record, cache.as_ref()).await? {
        None => {
            debug!(path = %record.path, "descriptor is valid");
            report.valid += 1;
            Ok(result::VALID)
        }
        Some(defect) => {
            warn!(path = %record.path, defect = %defect, "invalid descriptor");
            report.invalid += 1;
            remove_descriptor(ctx, options, record, Some(cache.as_mut()), report).await
        }
    }
}

/// Binds the object the descriptor's resource URL resolves to today.
async fn bind_expected(
    ctx: &ProxyContext,
    record: &Record<Descriptor>,
) -> Result<std::result::Result<Box<dyn CacheObject>, Defect>> {
    let Some(resource_id) = record.resource_id else {
        return Ok(Err(Defect::NoResource));
    };
    let Some(resource) = ctx.store.get::<Resource>(resource_id)? else {
        return Ok(Err(Defect::NoResource));
    };
    let unresolvable = |reason: String| Defect::Unresolvable {
        url: resource.url.clone(),
        reason,
    };
    let Some(netpath) = network_path(&resource.url) else {
        return Ok(Err(unresolvable("not a network path".to_string())));
    };
    let key = match ctx.backend.normalize_key(&ctx.rules.rewrite(&netpath)) {
        Ok(key) => key,
        Err(err) => return Ok(Err(unresolvable(err.to_string()))),
    };
    if key != record.path {
        debug!(path = %record.path, key = %key, "descriptor path differs from derived key");
    }
    Ok(Ok(ctx.backend.bind(&key).await?))
}

async fn validate(
    descriptor: &Descriptor,
    cache: &dyn CacheObject,
) -> std::io::Result<Option<Defect>> {
    if !(cache.partial() || cache.full()) {
        return Ok(Some(Defect::Missing(cache.path().to_string())));
    }
    let Some(expected) = descriptor.size else {
        return Ok(Some(Defect::NoContentLength(cache.path().to_string())));
    };
    if cache.full() {
        let actual = cache.disk_size().await?.unwrap_or(0);
        if actual != expected {
            return Ok(Some(Defect::SizeMismatch {
                path: cache.path().to_string(),
                expected,
                actual,
            }));
        }
    }
    Ok(None)
}

async fn remove_descriptor(
    ctx: &ProxyContext,
    options: &SweepOptions,
    record: &Record<Descriptor>,
    cache: Option<&mut dyn CacheObject>,
    report: &mut DescriptorReport,
) -> Result<&'static str> {
    if !options.prune {
        return Ok(result::INVALID);
    }
    if let Some(cache) = cache
        && (cache.partial() || cache.full())
    {
        let size = cache.disk_size().await?.unwrap_or(0);
        if size > options.max_size_prune {
            warn!(path = cache.path(), size, "keeping oversized cache object");
            report.kept += 1;
            return Ok(result::KEPT);
        }
        let removed = cache.remove().await?;
        info!(path = cache.path(), size = removed, "deleted cache object");
        report.bytes_reclaimed += removed;
    }

    let Some(id) = record.id() else {
        return Ok(result::INVALID);
    };
    ctx.store.delete::<Descriptor>(id)?;
    if let Some(resource_id) = record.resource_id
        && ctx.store.prune_resource(resource_id)?
    {
        debug!(resource_id, "pruned unreferenced resource");
    }
    info!(path = %record.path, "removed descriptor");
    report.removed += 1;
    Ok(result::REMOVED)
}
