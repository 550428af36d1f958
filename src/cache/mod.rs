//! Cache object handles.
//!
//! A [`CacheObject`] is the on-disk artifact bound to one cache key. The
//! coordinator only ever talks to it through this trait; the concrete layout
//! is owned by a [`CacheBackend`] selected with [`BackendKind`].

use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Deserialize;

mod file;
mod locks;

pub use file::{FileCache, FileTreeBackend, INCOMPLETE_SUFFIX};
pub use locks::{KeyLockGuard, KeyLocks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing stored for the key yet.
    New,
    /// An interrupted download is present.
    Partial,
    /// A complete representation is present.
    Full,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::New => "new",
            CacheState::Partial => "partial",
            CacheState::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    FileTree,
}

#[async_trait]
pub trait CacheObject: Send + Sync + Debug {
    /// Relative cache key this object is bound to.
    fn path(&self) -> &str;

    fn state(&self) -> CacheState;

    fn partial(&self) -> bool {
        self.state() == CacheState::Partial
    }

    fn full(&self) -> bool {
        self.state() == CacheState::Full
    }

    /// Known byte length: bytes on disk at bind time, or the expected length
    /// once a Content-Length was recorded.
    fn size(&self) -> u64;

    fn set_size(&mut self, size: u64);

    fn mtime(&self) -> Option<SystemTime>;

    fn set_mtime(&mut self, mtime: Option<SystemTime>);

    fn is_open(&self) -> bool;

    /// Re-binds the handle to another key and refreshes its state.
    async fn relocate(&mut self, path: &str) -> io::Result<()>;

    async fn open_new(&mut self) -> io::Result<()>;

    async fn open_partial(&mut self) -> io::Result<()>;

    async fn open_full(&mut self) -> io::Result<()>;

    async fn open(&mut self) -> io::Result<()> {
        match self.state() {
            CacheState::Partial => self.open_partial().await,
            CacheState::Full => self.open_full().await,
            CacheState::New => self.open_new().await,
        }
    }

    async fn append(&mut self, data: &[u8]) -> io::Result<()>;

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Flushes a write handle and settles the artifact. Returns the state the
    /// object ends up in.
    async fn finish(&mut self) -> io::Result<CacheState>;

    /// Bytes currently stored on disk, if anything is stored.
    async fn disk_size(&self) -> io::Result<Option<u64>>;

    /// Deletes the stored artifact and returns the number of bytes removed.
    async fn remove(&mut self) -> io::Result<u64>;

    /// Drops any open handle. Safe to call repeatedly.
    fn close(&mut self);
}

#[async_trait]
pub trait CacheBackend: Send + Sync + Debug {
    fn kind(&self) -> BackendKind;

    fn root(&self) -> &Path;

    /// The key an object for `key` is actually stored under.
    fn normalize_key(&self, key: &str) -> io::Result<String>;

    async fn bind(&self, key: &str) -> io::Result<Box<dyn CacheObject>>;
}

pub fn load_backend(kind: BackendKind, root: PathBuf) -> Arc<dyn CacheBackend> {
    match kind {
        BackendKind::FileTree => Arc::new(FileTreeBackend::new(root)),
    }
}
