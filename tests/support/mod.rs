#![allow(dead_code)]

pub mod dirs;
pub mod logging;

use std::sync::Arc;

use anyhow::Result;
use http::{HeaderMap, HeaderValue, header::HeaderName};

use htcache::{
    cache::{BackendKind, load_backend},
    proxy::{DateFormats, ProxyContext},
    rules::{RewriteRules, RuleConfig},
    store::MetadataStore,
    sweep::SweepOptions,
};

pub use dirs::TestDirs;
pub use logging::CacheLogRecorder;

pub const VIA_TOKEN: &str = "1.1 proxy.test:8080";
pub const LAST_MODIFIED: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

pub struct TestCache {
    pub dirs: TestDirs,
    pub ctx: Arc<ProxyContext>,
}

impl TestCache {
    /// A file-tree cache with no rewrite rules.
    pub fn new() -> Result<Self> {
        Self::with_join(&[])
    }

    /// A file-tree cache whose keys are produced by the given join rules.
    pub fn with_join(join: &[(&str, &str)]) -> Result<Self> {
        let dirs = TestDirs::new()?;
        let join = join
            .iter()
            .map(|(pattern, replacement)| RuleConfig {
                pattern: pattern.to_string(),
                replacement: replacement.to_string(),
            })
            .collect::<Vec<_>>();
        let rules = RewriteRules::compile(&join, &[])?;
        let store = MetadataStore::open(&dirs.data, true)?;
        let ctx = ProxyContext::new(
            load_backend(BackendKind::FileTree, dirs.cache_root.clone()),
            Arc::new(rules),
            store,
            DateFormats::standard()?,
            VIA_TOKEN,
        );
        Ok(Self {
            dirs,
            ctx: Arc::new(ctx),
        })
    }

    pub fn options(&self, prune: bool, max_size_prune: u64) -> SweepOptions {
        SweepOptions {
            prune,
            max_size_prune,
        }
    }
}

pub fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for &(name, value) in pairs {
        headers.append(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    headers
}

pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
