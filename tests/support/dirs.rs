use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

pub struct TestDirs {
    _temp: TempDir,
    pub cache_root: PathBuf,
    pub data: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_root = temp.path().join("cache");
        std::fs::create_dir_all(&cache_root)?;
        let data = temp.path().join("htcache.sqlite");
        Ok(Self {
            _temp: temp,
            cache_root,
            data,
        })
    }

    /// Absolute location of a cache key.
    pub fn object(&self, key: &str) -> PathBuf {
        self.cache_root.join(key)
    }

    /// Writes `len` bytes at `key` below the cache root, creating parents.
    pub fn write_object(&self, key: &str, len: usize) -> Result<PathBuf> {
        let path = self.object(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, vec![b'x'; len])?;
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.cache_root
    }
}
