use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use super::{BackendKind, CacheBackend, CacheObject, CacheState};

/// Suffix of the file holding an interrupted download.
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// File name used when a key names a directory.
const DIRECTORY_INDEX: &str = "index";

/// Stores every object as a plain file at `<root>/<key>`, with partial
/// downloads kept at `<root>/<key>.incomplete` until they complete.
#[derive(Debug, Clone)]
pub struct FileTreeBackend {
    root: PathBuf,
}

impl FileTreeBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

/// Rejects keys that would escape the cache root and maps directory keys
/// onto their index file.
pub(crate) fn normalize_key(key: &str) -> io::Result<String> {
    if key.starts_with('/') {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("cache key '{key}' must be relative"),
        ));
    }
    let escapes = Path::new(key)
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));
    if escapes {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("cache key '{key}' contains non-normal path components"),
        ));
    }
    if key.is_empty() || key.ends_with('/') {
        return Ok(format!("{key}{DIRECTORY_INDEX}"));
    }
    Ok(key.to_string())
}

#[async_trait]
impl CacheBackend for FileTreeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::FileTree
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn normalize_key(&self, key: &str) -> io::Result<String> {
        normalize_key(key)
    }

    async fn bind(&self, key: &str) -> io::Result<Box<dyn CacheObject>> {
        let mut object = FileCache::new(self.root.clone(), normalize_key(key)?);
        object.stat().await?;
        Ok(Box::new(object))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    Write,
    Read,
}

#[derive(Debug)]
pub struct FileCache {
    root: PathBuf,
    path: String,
    state: CacheState,
    size: u64,
    mtime: Option<SystemTime>,
    file: Option<AsyncFile>,
    mode: Option<OpenMode>,
    written: u64,
}

impl FileCache {
    fn new(root: PathBuf, path: String) -> Self {
        Self {
            root,
            path,
            state: CacheState::New,
            size: 0,
            mtime: None,
            file: None,
            mode: None,
            written: 0,
        }
    }

    pub fn location(&self) -> PathBuf {
        self.root.join(&self.path)
    }

    pub fn incomplete_location(&self) -> PathBuf {
        self.root.join(format!("{}{INCOMPLETE_SUFFIX}", self.path))
    }

    /// Refreshes state, size and mtime from whatever is on disk.
    async fn stat(&mut self) -> io::Result<()> {
        self.state = CacheState::New;
        self.size = 0;
        self.mtime = None;
        if let Some(meta) = metadata_if_file(&self.location()).await? {
            self.state = CacheState::Full;
            self.size = meta.len();
            self.mtime = meta.modified().ok();
        } else if let Some(meta) = metadata_if_file(&self.incomplete_location()).await? {
            self.state = CacheState::Partial;
            self.size = meta.len();
            self.mtime = meta.modified().ok();
        }
        trace!(path = %self.path, state = self.state.as_str(), size = self.size, "bound cache object");
        Ok(())
    }

    async fn open_for_write(&mut self, truncate: bool) -> io::Result<()> {
        let target = self.incomplete_location();
        if let Some(parent) = target.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        let mut options = async_fs::OpenOptions::new();
        options.create(true).write(true);
        if truncate {
            options.truncate(true);
        } else {
            options.append(true);
        }
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let file = options.open(&target).await?;
        self.written = if truncate {
            0
        } else {
            file.metadata().await?.len()
        };
        self.file = Some(file);
        self.mode = Some(OpenMode::Write);
        Ok(())
    }

    fn writer(&mut self) -> io::Result<&mut AsyncFile> {
        match (self.mode, self.file.as_mut()) {
            (Some(OpenMode::Write), Some(file)) => Ok(file),
            _ => Err(io::Error::other(format!(
                "cache object '{}' is not open for writing",
                self.path
            ))),
        }
    }
}

async fn metadata_if_file(path: &Path) -> io::Result<Option<std::fs::Metadata>> {
    match async_fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta)),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

async fn stamp_mtime(path: PathBuf, mtime: SystemTime) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(mtime)
    })
    .await
    .map_err(io::Error::other)?
}

async fn remove_if_present(path: &Path) -> io::Result<u64> {
    let Some(meta) = metadata_if_file(path).await? else {
        return Ok(0);
    };
    match async_fs::remove_file(path).await {
        Ok(()) => Ok(meta.len()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl CacheObject for FileCache {
    fn path(&self) -> &str {
        &self.path
    }

    fn state(&self) -> CacheState {
        self.state
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    fn set_mtime(&mut self, mtime: Option<SystemTime>) {
        self.mtime = mtime;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    async fn relocate(&mut self, path: &str) -> io::Result<()> {
        self.close();
        self.path = normalize_key(path)?;
        self.stat().await
    }

    async fn open_new(&mut self) -> io::Result<()> {
        self.open_for_write(true).await
    }

    async fn open_partial(&mut self) -> io::Result<()> {
        self.open_for_write(false).await
    }

    async fn open_full(&mut self) -> io::Result<()> {
        let file = AsyncFile::open(self.location()).await?;
        self.file = Some(file);
        self.mode = Some(OpenMode::Read);
        Ok(())
    }

    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer()?.write_all(data).await?;
        self.written = self.written.saturating_add(data.len() as u64);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match (self.mode, self.file.as_mut()) {
            (Some(OpenMode::Read), Some(file)) => file.read(buf).await,
            _ => Err(io::Error::other(format!(
                "cache object '{}' is not open for reading",
                self.path
            ))),
        }
    }

    async fn finish(&mut self) -> io::Result<CacheState> {
        if self.mode != Some(OpenMode::Write) {
            self.close();
            return Ok(self.state);
        }
        self.writer()?.flush().await?;
        self.close();

        // An unknown length means the transport ran the body to its end.
        if self.size == 0 {
            self.size = self.written;
        }
        let incomplete = self.incomplete_location();
        let target = if self.written == self.size {
            let location = self.location();
            async_fs::rename(&incomplete, &location).await?;
            self.state = CacheState::Full;
            location
        } else {
            debug!(
                path = %self.path,
                written = self.written,
                expected = self.size,
                "cache object left incomplete"
            );
            self.state = CacheState::Partial;
            incomplete
        };
        if let Some(mtime) = self.mtime {
            stamp_mtime(target, mtime).await?;
        }
        Ok(self.state)
    }

    async fn disk_size(&self) -> io::Result<Option<u64>> {
        let location = match self.state {
            CacheState::Full => self.location(),
            CacheState::Partial => self.incomplete_location(),
            CacheState::New => return Ok(None),
        };
        Ok(metadata_if_file(&location).await?.map(|meta| meta.len()))
    }

    async fn remove(&mut self) -> io::Result<u64> {
        self.close();
        let removed = remove_if_present(&self.location()).await?
            + remove_if_present(&self.incomplete_location()).await?;
        self.state = CacheState::New;
        self.size = 0;
        self.mtime = None;
        Ok(removed)
    }

    fn close(&mut self) {
        self.file = None;
        self.mode = None;
    }
}
