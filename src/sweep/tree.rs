use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs as async_fs;
use tracing::{debug, info, warn};

use super::{SweepOptions, result};
use crate::cache::INCOMPLETE_SUFFIX;
use crate::metrics;
use crate::proxy::ProxyContext;

const PASS: &str = "files";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TreeReport {
    /// Entries inspected, not counting those directly under the root.
    pub entries: usize,
    pub claimed: usize,
    pub orphaned: usize,
    pub unrecognized: usize,
    pub multi_owner: usize,
    pub removed: usize,
    pub kept: usize,
    pub failed: usize,
    pub bytes_reclaimed: u64,
}

/// The cache key an on-disk file belongs to, with `/` separators and the
/// partial-download suffix removed.
fn claiming_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    let key = parts.join("/");
    Some(match key.strip_suffix(INCOMPLETE_SUFFIX) {
        Some(stripped) => stripped.to_string(),
        None => key,
    })
}

/// Walks the cache root and checks every entry below its first level against
/// the descriptors claiming it. Unclaimed files are orphans; with pruning on
/// they are deleted when smaller than the prune ceiling.
pub async fn check_files(ctx: &ProxyContext, options: &SweepOptions) -> Result<TreeReport> {
    let root = ctx.backend.root().to_path_buf();
    let mut report = TreeReport::default();
    metrics::record_sweep_run(PASS);
    info!(root = %root.display(), prune = options.prune, "checking cache tree");

    let mut pending: Vec<PathBuf> = vec![root.clone()];
    while let Some(dir) = pending.pop() {
        let mut entries = match async_fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound && dir == root => {
                warn!(root = %root.display(), "cache root does not exist");
                return Ok(report);
            }
            Err(err) if dir == root => {
                return Err(err)
                    .with_context(|| format!("failed to read cache root {}", root.display()));
            }
            Err(err) => {
                warn!(error = %err, path = %dir.display(), "failed to read cache directory");
                report.failed += 1;
                continue;
            }
        };

        let mut children = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => children.push(entry),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, path = %dir.display(), "failed to list cache directory");
                    report.failed += 1;
                    break;
                }
            }
        }
        children.sort_by_key(|entry| entry.file_name());

        for entry in children {
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to stat cache entry");
                    report.failed += 1;
                    continue;
                }
            };
            if file_type.is_dir() {
                pending.push(path.clone());
            }
            // Files directly under the root are not cache objects.
            if dir == root {
                continue;
            }
            report.entries += 1;
            let outcome = check_entry(ctx, options, &root, &path, file_type, &mut report).await;
            metrics::record_sweep_entry(PASS, outcome);
        }
    }

    metrics::record_sweep_reclaimed(report.bytes_reclaimed);
    info!(
        entries = report.entries,
        claimed = report.claimed,
        orphaned = report.orphaned,
        removed = report.removed,
        "finished checking cache tree"
    );
    Ok(report)
}

async fn check_entry(
    ctx: &ProxyContext,
    options: &SweepOptions,
    root: &Path,
    path: &Path,
    file_type: std::fs::FileType,
    report: &mut TreeReport,
) -> &'static str {
    let Some(key) = claiming_key(root, path) else {
        warn!(path = %path.display(), "unrecognized path");
        report.unrecognized += 1;
        return result::UNRECOGNIZED;
    };
    let owners = match ctx.store.owners(&key) {
        Ok(owners) => owners,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to look up descriptor");
            report.failed += 1;
            return result::FAILED;
        }
    };

    match owners.as_slice() {
        [] if file_type.is_file() => {
            warn!(path = %path.display(), "missing descriptor");
            report.orphaned += 1;
            if options.prune {
                prune_orphan(options, path, report).await
            } else {
                result::ORPHANED
            }
        }
        [] if file_type.is_dir() || file_type.is_symlink() => result::SKIPPED,
        [] => {
            warn!(path = %path.display(), "unrecognized path");
            report.unrecognized += 1;
            result::UNRECOGNIZED
        }
        [owner] => {
            debug!(path = %path.display(), url = %owner, "found resource");
            report.claimed += 1;
            result::CLAIMED
        }
        owners => {
            warn!(path = %path.display(), owners = ?owners, "multiple references");
            report.multi_owner += 1;
            result::MULTI_OWNER
        }
    }
}

async fn prune_orphan(options: &SweepOptions, path: &Path, report: &mut TreeReport) -> &'static str {
    let size = match async_fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to stat orphaned file");
            report.failed += 1;
            return result::FAILED;
        }
    };
    if size >= options.max_size_prune {
        warn!(path = %path.display(), size, "keeping oversized orphaned file");
        report.kept += 1;
        return result::KEPT;
    }
    match async_fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), size, "removed unknown file");
            report.removed += 1;
            report.bytes_reclaimed += size;
            result::REMOVED
        }
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to remove orphaned file");
            report.failed += 1;
            result::FAILED
        }
    }
}
