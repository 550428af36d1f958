//! Per-transaction cache coordinator.
//!
//! A [`ProxyData`] binds one proxied request to a cache object and a
//! descriptor record, rewrites the upstream request into a conditional one,
//! and settles both the object and the record once the upstream answers.
//! Operations must be called in phase order:
//!
//! `init_cache → init_data → prepare_request → finish_request →
//! prepare_response → close`
//!
//! `close` is valid from any phase and also runs on drop.

use std::sync::Arc;
use std::time::Instant;

use http::header::{
    ACCEPT_ENCODING, CACHE_CONTROL, CONNECTION, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    IF_RANGE, RANGE, REFERER,
};
use http::{HeaderMap, StatusCode};
use tracing::{debug, info};

use super::ProxyContext;
use super::error::TransactionError;
use super::headers::{X_RELATIONSHIP, append_via, header_text, quote_etag};
use super::location::{NETPATH_MARKER, network_path};
use super::mapper::{MappingTarget, content_range_total, map_to_data, map_to_headers};
use crate::cache::{CacheObject, CacheState, KeyLockGuard};
use crate::logging::CacheLogBuilder;
use crate::store::{Descriptor, Record, Resource};

/// Media type recorded when upstream did not send one.
pub const DEFAULT_MEDIATYPE: &str = "application/octet-stream";

type Result<T> = std::result::Result<T, TransactionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    CacheBound,
    DataBound,
    RequestPrepared,
    UpstreamDone,
    DataFinalized,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::CacheBound => "cache_bound",
            Phase::DataBound => "data_bound",
            Phase::RequestPrepared => "request_prepared",
            Phase::UpstreamDone => "upstream_done",
            Phase::DataFinalized => "data_finalized",
            Phase::Closed => "closed",
        }
    }
}

/// The kind of conditional request sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conditional {
    None,
    Resume,
    Revalidate,
}

impl Conditional {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conditional::None => "none",
            Conditional::Resume => "resume",
            Conditional::Revalidate => "revalidate",
        }
    }
}

pub struct ProxyData {
    ctx: Arc<ProxyContext>,
    url: String,
    phase: Phase,
    cache: Option<Box<dyn CacheObject>>,
    descriptor: Option<Record<Descriptor>>,
    resource: Option<Record<Resource>>,
    bound_state: Option<CacheState>,
    conditional: Conditional,
    lock: Option<KeyLockGuard>,
    served_from_cache: bool,
    durable: bool,
    failure: Option<(&'static str, String)>,
    started: Instant,
}

impl std::fmt::Debug for ProxyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyData")
            .field("url", &self.url)
            .field("phase", &self.phase)
            .field("cache", &self.cache.as_ref().map(|cache| cache.path()))
            .field("descriptor", &self.descriptor)
            .field("conditional", &self.conditional)
            .finish()
    }
}

impl ProxyData {
    /// Starts a transaction for `url`, which must already have its scheme
    /// stripped (`//host/path`).
    pub fn new(ctx: Arc<ProxyContext>, url: impl Into<String>) -> Self {
        crate::metrics::inc_inflight();
        Self {
            ctx,
            url: url.into(),
            phase: Phase::Init,
            cache: None,
            descriptor: None,
            resource: None,
            bound_state: None,
            conditional: Conditional::None,
            lock: None,
            served_from_cache: false,
            durable: false,
            failure: None,
            started: Instant::now(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn conditional(&self) -> Conditional {
        self.conditional
    }

    /// True once the response is answered from the stored object rather
    /// than from upstream.
    pub fn served_from_cache(&self) -> bool {
        self.served_from_cache
    }

    /// True once the descriptor has been committed by this transaction.
    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn is_open(&self) -> bool {
        self.cache.as_ref().is_some_and(|cache| cache.is_open())
    }

    pub fn cache(&self) -> Option<&dyn CacheObject> {
        self.cache.as_deref()
    }

    pub fn cache_mut(&mut self) -> Option<&mut (dyn CacheObject + 'static)> {
        self.cache.as_deref_mut()
    }

    pub fn descriptor(&self) -> Option<&Record<Descriptor>> {
        self.descriptor.as_ref()
    }

    pub fn descriptor_mut(&mut self) -> Option<&mut Record<Descriptor>> {
        self.descriptor.as_mut()
    }

    fn expect_phase(&self, operation: &'static str, allowed: &[Phase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(TransactionError::Phase {
                operation,
                phase: self.phase.as_str(),
            })
        }
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            debug!(url = %self.url, error = %err, phase = self.phase.as_str(), "transaction failed");
            self.failure = Some((err.kind(), err.to_string()));
        }
        result
    }

    fn bound(
        &mut self,
        operation: &'static str,
    ) -> Result<(&mut Box<dyn CacheObject>, &mut Record<Descriptor>)> {
        match (self.cache.as_mut(), self.descriptor.as_mut()) {
            (Some(cache), Some(descriptor)) => Ok((cache, descriptor)),
            _ => Err(TransactionError::Phase {
                operation,
                phase: self.phase.as_str(),
            }),
        }
    }

    /// Resolves the transaction URL to a cache key and binds the cache
    /// object stored under it.
    pub async fn init_cache(&mut self) -> Result<()> {
        let result = self.bind_cache().await;
        self.track(result)
    }

    async fn bind_cache(&mut self) -> Result<()> {
        self.expect_phase("init_cache", &[Phase::Init])?;
        if !self.url.starts_with(NETPATH_MARKER) {
            return Err(TransactionError::MalformedUrl {
                url: self.url.clone(),
            });
        }
        let netpath = network_path(&self.url).ok_or_else(|| TransactionError::MalformedUrl {
            url: self.url.clone(),
        })?;
        let key = self.ctx.rules.rewrite(&netpath);
        if key.starts_with('/') {
            return Err(TransactionError::AbsoluteCacheKey { key });
        }
        let cache = self.ctx.backend.bind(&key).await?;
        info!(
            url = %self.url,
            path = cache.path(),
            state = cache.state().as_str(),
            size = cache.size(),
            "prepped cache"
        );
        self.bound_state = Some(cache.state());
        self.cache = Some(cache);
        self.phase = Phase::CacheBound;
        Ok(())
    }

    /// Looks up the descriptor for the bound cache key, or starts a pending
    /// one carrying that key.
    pub fn init_data(&mut self) -> Result<()> {
        let result = self.bind_data();
        self.track(result)
    }

    fn bind_data(&mut self) -> Result<()> {
        self.expect_phase("init_data", &[Phase::CacheBound])?;
        let path = match &self.cache {
            Some(cache) => cache.path().to_string(),
            None => {
                return Err(TransactionError::Phase {
                    operation: "init_data",
                    phase: self.phase.as_str(),
                });
            }
        };
        if path.is_empty() || path.starts_with('/') {
            return Err(TransactionError::AbsoluteCacheKey { key: path });
        }

        let descriptor = match self.ctx.store.find(&Descriptor::by_path(&path))? {
            Some(record) if record.is_stored() => record,
            _ => Record::Pending(Descriptor::new(path)),
        };
        if let Some(resource_id) = descriptor.resource_id {
            self.resource = self.ctx.store.get::<Resource>(resource_id)?;
        }
        debug!(url = %self.url, descriptor = ?descriptor, "bound descriptor");
        self.descriptor = Some(descriptor);
        self.phase = Phase::DataBound;
        Ok(())
    }

    /// Binds cache and descriptor and opens the stored object for reading.
    /// Fails unless a committed descriptor and a complete object exist.
    pub async fn init_and_open(&mut self) -> Result<()> {
        self.init_cache().await?;
        self.init_data()?;
        let result = self.open_stored().await;
        self.track(result)
    }

    async fn open_stored(&mut self) -> Result<()> {
        let (cache, descriptor) = self.bound("init_and_open")?;
        if !(descriptor.is_stored() && cache.full()) {
            return Err(TransactionError::NothingToServe {
                path: cache.path().to_string(),
            });
        }
        cache.open().await?;
        self.served_from_cache = true;
        Ok(())
    }

    /// Rewrites the client's request headers into the request sent upstream.
    pub fn prepare_request(&mut self, headers: &mut HeaderMap) -> Result<()> {
        let result = self.rewrite_request(headers);
        self.track(result)
    }

    fn rewrite_request(&mut self, headers: &mut HeaderMap) -> Result<()> {
        self.expect_phase("prepare_request", &[Phase::DataBound])?;

        headers.remove(ACCEPT_ENCODING);
        if let Some(range) = headers.remove(RANGE) {
            return Err(TransactionError::ClientRange {
                value: range.to_str().unwrap_or("<binary>").to_string(),
            });
        }
        if let Some(cache_control) = headers.remove(CACHE_CONTROL) {
            // End-to-end reload and revalidation directives are not honoured.
            debug!(url = %self.url, value = ?cache_control, "dropped Cache-Control");
        }

        let ctx = self.ctx.clone();
        let (cache, descriptor) = self.bound("prepare_request")?;
        let etag = descriptor.etag.clone();
        let mut conditional = Conditional::None;
        match cache.state() {
            CacheState::Partial => {
                let validator = cache
                    .mtime()
                    .and_then(|mtime| ctx.dates.format(mtime))
                    .and_then(|value| HeaderValue::from_str(&value).ok());
                let range = HeaderValue::from_str(&format!("bytes={}-", cache.size())).ok();
                match (range, validator) {
                    (Some(range), Some(validator)) => {
                        info!(
                            path = cache.path(),
                            size = cache.size(),
                            "requesting resume of partial file"
                        );
                        headers.insert(RANGE, range);
                        headers.insert(IF_RANGE, validator);
                        conditional = Conditional::Resume;
                    }
                    _ => {
                        debug!(
                            path = cache.path(),
                            "partial file has no modification time, refetching"
                        );
                    }
                }
            }
            CacheState::Full => {
                if let Some(since) = cache
                    .mtime()
                    .and_then(|mtime| ctx.dates.format(mtime))
                    .and_then(|value| HeaderValue::from_str(&value).ok())
                {
                    debug!(path = cache.path(), size = cache.size(), "revalidating complete file");
                    headers.insert(IF_MODIFIED_SINCE, since);
                    conditional = Conditional::Revalidate;
                }
            }
            CacheState::New => {}
        }
        if let Some(etag) = etag
            && let Ok(value) = HeaderValue::from_str(&quote_etag(&etag))
        {
            headers.insert(IF_NONE_MATCH, value);
            if conditional == Conditional::None {
                conditional = Conditional::Revalidate;
            }
        }
        append_via(headers, &ctx.via);

        let relation = headers.remove(X_RELATIONSHIP);
        if let Some(referer) = header_text(headers, &REFERER) {
            // Relation rows are not recorded yet.
            debug!(url = %self.url, referer, relation = ?relation, "relation hint");
        }

        self.conditional = conditional;
        crate::metrics::record_conditional(conditional.as_str());
        self.phase = Phase::RequestPrepared;
        Ok(())
    }

    /// Settles the descriptor against the upstream response headers and
    /// opens the cache object for the body that follows.
    pub async fn finish_request(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<()> {
        let result = self.settle_upstream(status, headers).await;
        self.track(result)
    }

    async fn settle_upstream(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<()> {
        self.expect_phase("finish_request", &[Phase::RequestPrepared])?;
        let ctx = self.ctx.clone();
        let url = self.url.clone();
        let (cache, descriptor) = self.bound("finish_request")?;

        if descriptor.is_stored() {
            if cache.path() != descriptor.path {
                return Err(TransactionError::PathDivergence {
                    cache: cache.path().to_string(),
                    descriptor: descriptor.path.clone(),
                });
            }
        } else if cache.path() != descriptor.path {
            if cache.state() != CacheState::New {
                return Err(TransactionError::OpaqueMove {
                    state: cache.state().as_str(),
                    cache: cache.path().to_string(),
                    descriptor: descriptor.path.clone(),
                });
            }
            info!(from = cache.path(), to = %descriptor.path, "moving cache object");
            cache.relocate(&descriptor.path).await?;
            descriptor.path = cache.path().to_string();
        }

        if status == StatusCode::NOT_MODIFIED {
            if !cache.full() {
                return Err(TransactionError::NothingToServe {
                    path: cache.path().to_string(),
                });
            }
            cache.open_full().await?;
            self.served_from_cache = true;
            self.phase = Phase::UpstreamDone;
            return Ok(());
        }

        let resume = status == StatusCode::PARTIAL_CONTENT && cache.partial();
        if !resume {
            // A fresh representation replaces everything but identity and key.
            let fresh = Descriptor {
                resource_id: descriptor.resource_id,
                path: descriptor.path.clone(),
                ..Descriptor::default()
            };
            **descriptor = fresh;
            cache.set_size(0);
            cache.set_mtime(None);
        }
        let mut target = MappingTarget {
            descriptor: &mut **descriptor,
            cache: &mut **cache,
        };
        map_to_data(headers, &mut target, &ctx.dates)?;

        if resume {
            let total = content_range_total(headers);
            descriptor.size = total;
            cache.set_size(total.unwrap_or(0));
        }

        let guard = ctx
            .locks
            .try_acquire(cache.path())
            .ok_or_else(|| TransactionError::KeyBusy {
                key: cache.path().to_string(),
            })?;
        let needs_resource = descriptor.resource_id.is_none();
        if resume {
            cache.open_partial().await?;
        } else {
            cache.open_new().await?;
        }

        if needs_resource && self.resource.is_none() {
            self.resource = Some(
                ctx.store
                    .filter(&Resource::by_url(&url))?
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| Record::Pending(Resource::new(url))),
            );
        }
        self.lock = Some(guard);
        self.phase = Phase::UpstreamDone;
        Ok(())
    }

    /// Writes the descriptor-derived entity headers into the client response
    /// and makes the descriptor durable.
    pub fn prepare_response(&mut self, headers: &mut HeaderMap) -> Result<()> {
        let result = self.finalize_response(headers);
        self.track(result)
    }

    fn finalize_response(&mut self, headers: &mut HeaderMap) -> Result<()> {
        if !(self.phase == Phase::UpstreamDone
            || (self.phase == Phase::DataBound && self.served_from_cache))
        {
            return Err(TransactionError::Phase {
                operation: "prepare_response",
                phase: self.phase.as_str(),
            });
        }
        let ctx = self.ctx.clone();
        let served_from_cache = self.served_from_cache;
        let mut resource = self.resource.take();
        let (cache, descriptor) = self.bound("prepare_response")?;

        map_to_headers(descriptor, &**cache, &ctx.dates, headers);

        let mut committed = false;
        if !served_from_cache {
            if descriptor.resource_id.is_none()
                && let Some(resource) = resource.as_mut()
            {
                let resource_id = ctx.store.commit(resource)?;
                descriptor.resource_id = Some(resource_id);
            }
            if descriptor.mediatype.is_none() {
                descriptor.mediatype = Some(DEFAULT_MEDIATYPE.to_string());
            }
            // Another transaction may have stored this path since init_data.
            if !descriptor.is_stored()
                && let Some(id) = ctx
                    .store
                    .find(&Descriptor::by_path(&descriptor.path))?
                    .and_then(|stored| stored.id())
            {
                debug!(path = %descriptor.path, id, "adopting stored descriptor");
                let pending = Descriptor::clone(descriptor);
                *descriptor = Record::Stored(id, pending);
            }
            ctx.store.commit(descriptor)?;
            crate::metrics::record_descriptor_commit();
            committed = true;
        }

        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        append_via(headers, &ctx.via);

        self.resource = resource;
        self.durable |= committed;
        self.phase = Phase::DataFinalized;
        Ok(())
    }

    /// Appends a chunk of the upstream body to the cache object.
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        let result = match self.cache.as_mut() {
            Some(cache) => cache.append(data).await.map_err(TransactionError::from),
            None => Err(TransactionError::Phase {
                operation: "append",
                phase: self.phase.as_str(),
            }),
        };
        self.track(result)
    }

    /// Reads stored body bytes when serving from cache.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = match self.cache.as_mut() {
            Some(cache) => cache.read(buf).await.map_err(TransactionError::from),
            None => Err(TransactionError::Phase {
                operation: "read",
                phase: self.phase.as_str(),
            }),
        };
        self.track(result)
    }

    /// Settles the cache object after the body transfer and releases the
    /// writer lock.
    pub async fn finish_body(&mut self) -> Result<CacheState> {
        let result = self.settle_body().await;
        self.lock = None;
        self.track(result)
    }

    async fn settle_body(&mut self) -> Result<CacheState> {
        let Some(cache) = self.cache.as_mut() else {
            return Err(TransactionError::Phase {
                operation: "finish_body",
                phase: self.phase.as_str(),
            });
        };
        let state = cache.finish().await?;
        // A body of unknown length fixes the size only once it ends.
        if state == CacheState::Full
            && self.durable
            && !self.served_from_cache
            && let Some(descriptor) = self.descriptor.as_mut()
            && descriptor.size != Some(cache.size())
        {
            descriptor.size = Some(cache.size());
            self.ctx.store.commit(descriptor)?;
            debug!(path = %descriptor.path, size = cache.size(), "recorded final size");
        }
        Ok(state)
    }

    /// Releases the cache object, the descriptor and any writer lock. Safe
    /// to call repeatedly and from any phase.
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        let outcome = match &self.failure {
            Some(_) => "failed",
            None if self.served_from_cache => "cached",
            None if self.durable => "stored",
            None => "abandoned",
        };

        let mut log = CacheLogBuilder::new(self.url.clone())
            .conditional(self.conditional.as_str())
            .outcome(outcome)
            .durable(self.durable)
            .phase(self.phase.as_str())
            .elapsed(self.started.elapsed());
        if let Some(cache) = &self.cache {
            log = log.key(cache.path());
        }
        if let Some(state) = self.bound_state {
            log = log.state(state.as_str());
        }
        if let Some((reason, detail)) = &self.failure {
            log = log.error_reason(*reason).error_detail(detail.clone());
        }
        log.log();

        if let Some(cache) = self.cache.as_mut() {
            cache.close();
        }
        self.cache = None;
        self.descriptor = None;
        self.resource = None;
        self.lock = None;
        self.phase = Phase::Closed;
        crate::metrics::dec_inflight();
    }
}

impl Drop for ProxyData {
    fn drop(&mut self) {
        self.close();
    }
}
