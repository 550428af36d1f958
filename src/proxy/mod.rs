pub mod data;
pub mod dates;
pub mod error;
pub mod headers;
pub mod location;
pub mod mapper;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::{CacheBackend, KeyLocks, load_backend};
use crate::rules::Rewrite;
use crate::settings::Settings;
use crate::store::{DEFAULT_STORE, MetadataStore, StorePool, StoreRef};

pub use data::{Conditional, Phase, ProxyData};
pub use dates::DateFormats;
pub use error::{MapError, TransactionError};

/// Everything a transaction or a sweep needs, built once at startup.
#[derive(Debug)]
pub struct ProxyContext {
    pub backend: Arc<dyn CacheBackend>,
    pub rules: Arc<dyn Rewrite>,
    pub store: MetadataStore,
    pub dates: DateFormats,
    pub locks: KeyLocks,
    /// Token appended to `Via`, `1.1 host:port`.
    pub via: String,
}

impl ProxyContext {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        rules: Arc<dyn Rewrite>,
        store: MetadataStore,
        dates: DateFormats,
        via: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            rules,
            store,
            dates,
            locks: KeyLocks::new(),
            via: via.into(),
        }
    }

    pub fn from_settings(settings: &Settings, pool: &StorePool) -> Result<Self> {
        let store = pool
            .open(DEFAULT_STORE, &StoreRef::File(settings.data.clone()), true)
            .with_context(|| format!("failed to open metadata store {}", settings.data.display()))?;
        let backend = load_backend(settings.backend, settings.cache_root.clone());
        let rules = Arc::new(settings.rewrite_rules()?);
        Ok(Self::new(
            backend,
            rules,
            store,
            settings.date_formats()?,
            settings.via(),
        ))
    }

    /// Starts a transaction for `url` (`//host/path`).
    pub fn transaction(self: &Arc<Self>, url: impl Into<String>) -> ProxyData {
        ProxyData::new(self.clone(), url)
    }
}
