//! Offline reconciliation of the cache tree against the metadata store.
//!
//! [`check_files`] walks the tree looking for files no descriptor claims;
//! [`check_cache`] walks the descriptors looking for objects that are
//! missing or do not match their recorded length. Both only report unless
//! pruning is enabled. A sweep assumes it is the only writer to the tree.

use crate::settings::Settings;

mod descriptors;
mod tree;

pub use descriptors::{DescriptorReport, check_cache};
pub use tree::{TreeReport, check_files};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOptions {
    /// Delete what fails the checks.
    pub prune: bool,
    /// Files larger than this are never deleted by a sweep.
    pub max_size_prune: u64,
}

impl SweepOptions {
    /// Pruning is on when either the configuration or the command asks for it.
    pub fn from_settings(settings: &Settings, prune: bool) -> Self {
        Self {
            prune: settings.prune || prune,
            max_size_prune: settings.max_size_prune,
        }
    }
}

/// Outcome labels shared by both passes.
pub(crate) mod result {
    pub const CLAIMED: &str = "claimed";
    pub const VALID: &str = "valid";
    pub const ORPHANED: &str = "orphaned";
    pub const INVALID: &str = "invalid";
    pub const UNRECOGNIZED: &str = "unrecognized";
    pub const MULTI_OWNER: &str = "multi_owner";
    pub const REMOVED: &str = "removed";
    pub const KEPT: &str = "kept";
    pub const SKIPPED: &str = "skipped";
    pub const FAILED: &str = "failed";
}
