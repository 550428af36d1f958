use std::io;

use thiserror::Error;

use crate::store::StoreError;

/// Header values the mapper cannot translate into descriptor fields.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("unknown Content-Type parameter '{name}' in '{value}'")]
    UnknownContentTypeParameter { name: String, value: String },

    #[error("invalid Content-Length '{value}'")]
    InvalidContentLength { value: String },

    #[error("invalid qs parameter '{value}'")]
    InvalidQuality { value: String },

    #[error("header {name} is not valid text")]
    InvalidHeaderValue { name: String },
}

/// Conditions that abort one transaction. None of these are recoverable
/// inside the transaction; the transport answers with an error response.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("malformed transaction URL '{url}'")]
    MalformedUrl { url: String },

    #[error("cache key '{key}' must be relative")]
    AbsoluteCacheKey { key: String },

    #[error("client sent Range '{value}', ranged requests are not supported")]
    ClientRange { value: String },

    #[error("cache object at '{cache}' diverges from stored descriptor path '{descriptor}'")]
    PathDivergence { cache: String, descriptor: String },

    #[error("cannot move {state} cache object '{cache}' to '{descriptor}'")]
    OpaqueMove {
        state: &'static str,
        cache: String,
        descriptor: String,
    },

    #[error("nothing to serve from cache for '{path}'")]
    NothingToServe { path: String },

    #[error("cache key '{key}' is being written by another transaction")]
    KeyBusy { key: String },

    #[error("{operation} called in phase {phase}")]
    Phase {
        operation: &'static str,
        phase: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("cache object I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl TransactionError {
    /// Short label used for metrics and the cache log.
    pub fn kind(&self) -> &'static str {
        match self {
            TransactionError::MalformedUrl { .. } => "malformed_url",
            TransactionError::AbsoluteCacheKey { .. } => "absolute_key",
            TransactionError::ClientRange { .. } => "client_range",
            TransactionError::PathDivergence { .. } => "path_divergence",
            TransactionError::OpaqueMove { .. } => "opaque_move",
            TransactionError::NothingToServe { .. } => "nothing_to_serve",
            TransactionError::KeyBusy { .. } => "key_busy",
            TransactionError::Phase { .. } => "phase",
            TransactionError::Store(_) => "store",
            TransactionError::Map(_) => "map",
            TransactionError::Io(_) => "io",
        }
    }
}
