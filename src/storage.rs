//! Storage abstraction underneath the upload handlers.
//!
//! The handlers speak to a [`Storage`] trait; the one driver here is the
//! local filesystem rooted at `write_to`. Every operation double-checks that
//! its operands stay below the root.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::protofile::ProtoFile;

/// What little the handlers need to know about an existing entry.
#[derive(Debug)]
pub struct Meta {
    pub is_dir: bool,
    pub len: u64,
}

/// Capabilities the request handlers require of a storage backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Creates `dir` and any missing parents.
    async fn ensure_dir(&self, dir: &Path) -> io::Result<()>;

    /// Opens a proto file destined for `dir/filename`, creating `dir` first.
    async fn create_proto(&self, dir: &Path, filename: &str) -> io::Result<ProtoFile>;

    /// Atomically renames `src` over `dst`.
    async fn rename(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Duplicates the bytes of `src` under `dst`.
    async fn copy(&self, src: &Path, dst: &Path) -> io::Result<u64>;

    /// Removes a file, or a directory with everything below it.
    async fn remove_all(&self, path: &Path) -> io::Result<()>;

    async fn stat(&self, path: &Path) -> io::Result<Meta>;
}

/// Filesystem-backed storage rooted at a dedicated directory.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn check_contained(&self, path: &Path) -> io::Result<()> {
        if path.starts_with(&self.root) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path outside the storage root",
            ))
        }
    }
}

#[async_trait]
impl Storage for LocalStore {
    async fn ensure_dir(&self, dir: &Path) -> io::Result<()> {
        self.check_contained(dir)?;
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder.create(dir).await
    }

    async fn create_proto(&self, dir: &Path, filename: &str) -> io::Result<ProtoFile> {
        self.check_contained(dir)?;
        ProtoFile::create(dir, filename).await
    }

    async fn rename(&self, src: &Path, dst: &Path) -> io::Result<()> {
        self.check_contained(src)?;
        self.check_contained(dst)?;
        if let Some(parent) = dst.parent() {
            self.ensure_dir(parent).await?;
        }
        fs::rename(src, dst).await
    }

    async fn copy(&self, src: &Path, dst: &Path) -> io::Result<u64> {
        self.check_contained(src)?;
        self.check_contained(dst)?;
        if let Some(parent) = dst.parent() {
            self.ensure_dir(parent).await?;
        }
        fs::copy(src, dst).await
    }

    async fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.check_contained(path)?;
        let meta = fs::metadata(path).await?;
        if meta.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        }
    }

    async fn stat(&self, path: &Path) -> io::Result<Meta> {
        self.check_contained(path)?;
        let meta = fs::metadata(path).await?;
        Ok(Meta { is_dir: meta.is_dir(), len: meta.len() })
    }
}
