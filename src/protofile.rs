//! Write units that emerge under their final name only once complete.
//!
//! A [`ProtoFile`] is an open handle whose contents are invisible to other
//! observers until [`ProtoFile::persist`] publishes them atomically. On Linux
//! the handle is a nameless `O_TMPFILE` descriptor linked into place; where
//! that is unavailable a dotfile in the target directory is renamed over the
//! final name. Dropping an unpersisted handle discards it.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::config::RESERVE_FILESIZE_THRESHOLD;

/// Errors publishing a proto file under its final name.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The final name is taken by a directory.
    #[error("target name exists as a directory")]
    Conflict,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A file that can still be discarded or named, in that order of commitment.
#[derive(Debug)]
pub struct ProtoFile {
    file: Option<File>,
    final_path: PathBuf,
    /// `None` for the nameless backend, which has no directory entry to clean.
    temp_path: Option<PathBuf>,
    persisted: bool,
}

impl ProtoFile {
    /// Opens a write handle destined for `dir/filename`.
    ///
    /// The directory is created first (0755, with parents). Backend selection
    /// happens here: a nameless handle where the kernel and filesystem
    /// support it, a dotfile otherwise.
    pub async fn create(dir: &Path, filename: &str) -> io::Result<ProtoFile> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder.create(dir).await?;

        let final_path = dir.join(filename);

        #[cfg(target_os = "linux")]
        match open_nameless(dir).await {
            Ok(file) => {
                return Ok(ProtoFile {
                    file: Some(file),
                    final_path,
                    temp_path: None,
                    persisted: false,
                });
            }
            Err(err) if !nameless_unsupported(&err) => return Err(err),
            Err(_) => {}
        }

        let temp_path = dir.join(format!(".{filename}.tmp.{}", Uuid::new_v4()));
        let file = open_dotfile(&temp_path).await?;
        Ok(ProtoFile {
            file: Some(file),
            final_path,
            temp_path: Some(temp_path),
            persisted: false,
        })
    }

    /// Asks the filesystem to reserve space for the anticipated contents.
    ///
    /// Skipped below a threshold. A failed reservation never aborts the
    /// upload; sparse files are acceptable.
    pub async fn size_will_be(&mut self, num_bytes: u64) {
        if num_bytes <= RESERVE_FILESIZE_THRESHOLD {
            return;
        }
        let Some(file) = self.file.as_ref() else {
            return;
        };

        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            let fd = file.as_raw_fd();
            let len = num_bytes.min(i64::MAX as u64) as libc::off_t;
            let outcome = tokio::task::spawn_blocking(move || {
                let rc = unsafe { libc::fallocate(fd, 0, 0, len) };
                if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
            })
            .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "space reservation skipped"),
                Err(err) => debug!(error = %err, "space reservation skipped"),
            }
        }
        #[cfg(not(target_os = "linux"))]
        if let Err(err) = file.set_len(num_bytes).await {
            debug!(error = %err, "space reservation skipped");
        }
    }

    /// Appends a chunk to the not-yet-visible contents.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk).await,
            None => Err(io::Error::other("proto file already closed")),
        }
    }

    /// Flushes and atomically publishes the contents under the final name.
    ///
    /// A reader of the final path sees either nothing or the complete
    /// contents, never a partial write.
    pub async fn persist(mut self) -> Result<(), PersistError> {
        let Some(file) = self.file.take() else {
            return Err(PersistError::Io(io::Error::other("proto file already closed")));
        };
        file.sync_all().await?;

        if let Some(temp_path) = self.temp_path.clone() {
            drop(file);
            rename_into_place(&temp_path, &self.final_path).await?;
            self.temp_path = None;
        } else {
            #[cfg(target_os = "linux")]
            link_into_place(&file, &self.final_path).await?;
            #[cfg(not(target_os = "linux"))]
            return Err(PersistError::Io(io::Error::other("nameless backend unavailable")));
        }

        if let Some(parent) = self.final_path.parent() {
            let _ = sync_dir(parent).await;
        }
        self.persisted = true;
        Ok(())
    }

    /// Discards a file that has not been persisted; a no-op afterwards.
    pub async fn zap(mut self) {
        if self.persisted {
            return;
        }
        drop(self.file.take());
        if let Some(temp_path) = self.temp_path.take() {
            let _ = fs::remove_file(&temp_path).await;
        }
    }
}

impl Drop for ProtoFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        // Covers early returns, panics, and canceled request futures. The
        // nameless backend vanishes with its descriptor.
        if let Some(temp_path) = self.temp_path.take() {
            let _ = std::fs::remove_file(&temp_path);
        }
    }
}

#[cfg(target_os = "linux")]
async fn open_nameless(dir: &Path) -> io::Result<File> {
    let dir = dir.to_path_buf();
    let std_file = tokio::task::spawn_blocking(move || {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_TMPFILE)
            .mode(0o600)
            .open(&dir)
    })
    .await
    .map_err(io::Error::other)??;
    Ok(File::from_std(std_file))
}

/// The kernel predates `O_TMPFILE`, or the filesystem declines it.
#[cfg(target_os = "linux")]
fn nameless_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EISDIR) | Some(libc::ENOENT) | Some(libc::EOPNOTSUPP) | Some(libc::EINVAL)
    )
}

async fn open_dotfile(temp_path: &Path) -> io::Result<File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let file = options.open(temp_path).await?;
    #[cfg(target_os = "linux")]
    acquire_write_lease(&file);
    Ok(file)
}

/// Best-effort; the lease is released with the descriptor.
#[cfg(target_os = "linux")]
fn acquire_write_lease(file: &File) {
    use std::os::fd::AsRawFd;
    unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLEASE, libc::F_WRLCK) };
}

#[cfg(target_os = "linux")]
async fn link_into_place(file: &File, final_path: &Path) -> Result<(), PersistError> {
    use std::os::fd::AsRawFd;
    let fd = file.as_raw_fd();
    match link_fd(fd, final_path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            match fs::metadata(final_path).await {
                Ok(meta) if meta.is_dir() => Err(PersistError::Conflict),
                Ok(_) => {
                    // Someone claimed our name; overwrite like creat() would.
                    fs::remove_file(final_path).await?;
                    link_fd(fd, final_path).await.map_err(PersistError::Io)
                }
                Err(stat_err) => Err(PersistError::Io(stat_err)),
            }
        }
        Err(err) => Err(PersistError::Io(err)),
    }
}

/// Gives a nameless file a name by linking its descriptor into place.
#[cfg(target_os = "linux")]
async fn link_fd(fd: i32, final_path: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let source = CString::new(format!("/proc/self/fd/{fd}")).map_err(io::Error::other)?;
    let target = CString::new(final_path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    tokio::task::spawn_blocking(move || {
        let rc = unsafe {
            libc::linkat(
                libc::AT_FDCWD,
                source.as_ptr(),
                libc::AT_FDCWD,
                target.as_ptr(),
                libc::AT_SYMLINK_FOLLOW,
            )
        };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    })
    .await
    .map_err(io::Error::other)?
}

async fn rename_into_place(temp_path: &Path, final_path: &Path) -> Result<(), PersistError> {
    match fs::rename(temp_path, final_path).await {
        Ok(()) => Ok(()),
        Err(err) => match fs::metadata(final_path).await {
            Ok(meta) if meta.is_dir() => Err(PersistError::Conflict),
            Ok(_) => {
                // Rename over an existing entry is racy on some systems;
                // clear the name and retry once.
                fs::remove_file(final_path).await?;
                fs::rename(temp_path, final_path).await.map_err(PersistError::Io)
            }
            Err(_) => Err(PersistError::Io(err)),
        },
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entries(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .expect("read_dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn contents_stay_invisible_until_persist() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("sub");

        let mut proto = ProtoFile::create(&dir, "out.bin").await.expect("create");
        proto.write_chunk(b"DELME").await.expect("write");
        assert!(!dir.join("out.bin").exists());

        proto.persist().await.expect("persist");
        let contents = std::fs::read(dir.join("out.bin")).expect("read back");
        assert_eq!(contents, b"DELME");
    }

    #[tokio::test]
    async fn zap_leaves_no_trace() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();

        let mut proto = ProtoFile::create(&dir, "gone.bin").await.expect("create");
        proto.write_chunk(b"junk").await.expect("write");
        proto.zap().await;

        assert!(entries(&dir).is_empty(), "{:?}", entries(&dir));
    }

    #[tokio::test]
    async fn dropping_discards_like_zap() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();

        let mut proto = ProtoFile::create(&dir, "gone.bin").await.expect("create");
        proto.write_chunk(b"junk").await.expect("write");
        drop(proto);

        assert!(entries(&dir).is_empty(), "{:?}", entries(&dir));
    }

    #[tokio::test]
    async fn persist_overwrites_an_existing_file() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();
        std::fs::write(dir.join("out.bin"), b"old").expect("seed");

        let mut proto = ProtoFile::create(&dir, "out.bin").await.expect("create");
        proto.write_chunk(b"new").await.expect("write");
        proto.persist().await.expect("persist");

        assert_eq!(std::fs::read(dir.join("out.bin")).expect("read back"), b"new");
    }

    #[tokio::test]
    async fn persist_refuses_a_directory_in_the_way() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();
        std::fs::create_dir(dir.join("taken")).expect("seed dir");

        let mut proto = ProtoFile::create(&dir, "taken").await.expect("create");
        proto.write_chunk(b"data").await.expect("write");
        let result = proto.persist().await;
        assert!(matches!(result, Err(PersistError::Conflict)));
        assert!(dir.join("taken").is_dir());
    }

    #[tokio::test]
    async fn reservation_failures_do_not_abort_the_write() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();

        let mut proto = ProtoFile::create(&dir, "big.bin").await.expect("create");
        proto.size_will_be(RESERVE_FILESIZE_THRESHOLD + 1).await;
        proto.write_chunk(b"tiny").await.expect("write");
        proto.persist().await.expect("persist");

        // A reservation may leave the file sparse or zero-padded; zap/persist
        // semantics are what matters, the observable name has the real bytes.
        let meta = std::fs::metadata(dir.join("big.bin")).expect("stat");
        assert!(meta.len() >= 4);
    }
}
