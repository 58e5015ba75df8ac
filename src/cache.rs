use crate::client::RemoteStore;
use crate::error::{FuseError, RemoteError};
use crate::wire::{Conflict, Existence};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

/// §4.D: a download that comes back a different size than `file()` reported
/// is retried this many times before being treated as a fatal error.
const DOWNLOAD_RETRIES: u32 = 10;

/// Errors surfaced by [`CachedFile`] operations. Distinct from
/// [`RemoteError`] because a cache op can also fail on local temp-file I/O
/// or be attempted against an already-unlinked file.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("operation on unlinked cached file")]
    Unlinked,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("local cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CacheError> for FuseError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Unlinked => FuseError::EACCES,
            CacheError::Remote(e) => e.into(),
            CacheError::Io(e) => {
                log::error!("cache I/O error: {e}");
                FuseError::EIO
            }
        }
    }
}

/// Write-back, temp-file-backed cache for one remote path (§4.D). A single
/// `CachedFile` is shared by every open file handle pointing at the same
/// path — `inc_ref`/`dec_ref` track how many handles are pinning it open.
/// `fd` is lazily populated by [`CachedFile::retrieve`] on first access, not
/// at construction time, matching the `retrieve()` internal op in §4.D.
pub struct CachedFile {
    remote: Arc<dyn RemoteStore>,
    temp_dir: PathBuf,
    /// Cleared by `unlink`: pins the scratch against re-upload (§3 lifecycle).
    path: Option<String>,
    fd: Option<File>,
    temp_path: Option<PathBuf>,
    dirty: bool,
    refs: u32,
}

impl CachedFile {
    pub fn new(remote: Arc<dyn RemoteStore>, temp_dir: PathBuf, path: String) -> Self {
        Self {
            remote,
            temp_dir,
            path: Some(path),
            fd: None,
            temp_path: None,
            dirty: false,
            refs: 1,
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn inc_ref(&mut self) {
        self.refs += 1;
    }

    /// Returns the remaining reference count after decrementing.
    pub fn dec_ref(&mut self) -> u32 {
        self.refs = self.refs.saturating_sub(1);
        self.refs
    }

    pub fn ref_count(&self) -> u32 {
        self.refs
    }

    /// §3 lifecycle: "a successful unlink sets path = null on every live
    /// CachedFile bound to that path, so subsequent flush is a no-op."
    pub fn clear_path(&mut self) {
        self.path = None;
    }

    /// Lazily populates `fd`. No-op if already present. Fails `EACCES`
    /// (via [`CacheError::Unlinked`]) if `path` has been cleared.
    fn retrieve(&mut self) -> Result<(), CacheError> {
        if self.fd.is_some() {
            return Ok(());
        }
        let path = self.path.clone().ok_or(CacheError::Unlinked)?;
        let (mut fd, temp_path) = new_temp_file(&self.temp_dir)?;

        let expected_size = match self.remote.file(&path) {
            Ok(meta) => meta.size,
            Err(RemoteError::NotFound) => {
                self.fd = Some(fd);
                self.temp_path = Some(temp_path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = match self.remote.get_file_reader(&path) {
            Ok(r) => r,
            Err(RemoteError::NotFound) => {
                self.fd = Some(fd);
                self.temp_path = Some(temp_path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut attempt = 0;
        loop {
            fd.set_len(0)?;
            fd.seek(SeekFrom::Start(0))?;
            let written = std::io::copy(&mut reader, &mut fd)?;
            if written == expected_size {
                break;
            }
            attempt += 1;
            if attempt >= DOWNLOAD_RETRIES {
                return Err(CacheError::Remote(RemoteError::ServerError(format!(
                    "retrieve {path}: size mismatch after {attempt} attempts (expected {expected_size}, got {written})"
                ))));
            }
            log::warn!(
                "retrieve {path}: size mismatch (expected {expected_size}, got {written}), retrying attempt {attempt}"
            );
            reader = self.remote.get_file_reader(&path)?;
        }
        fd.seek(SeekFrom::Start(0))?;
        self.fd = Some(fd);
        self.temp_path = Some(temp_path);
        Ok(())
    }

    /// §4.D `read(size, offset)`: EOF short-read is permitted.
    pub fn read(&mut self, offset: u64, size: u32) -> Result<Vec<u8>, CacheError> {
        self.retrieve()?;
        let fd = self.fd.as_mut().expect("retrieve populates fd");
        fd.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        let n = std::io::Read::read(fd, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// §4.D `write(buf, offset)`: always reports the full length written.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<u32, CacheError> {
        self.retrieve()?;
        let fd = self.fd.as_mut().expect("retrieve populates fd");
        fd.seek(SeekFrom::Start(offset))?;
        std::io::Write::write_all(fd, data)?;
        self.dirty = true;
        Ok(data.len() as u32)
    }

    /// §4.D `truncate(len)`: retrieves first when shrinking/growing from a
    /// non-empty authentic prefix, then unconditionally marks dirty and
    /// flushes immediately (there is no subsequent `release` hook when this
    /// is invoked without a handle — §4.E `truncate(path, len, fh=None)`).
    pub fn truncate(&mut self, len: u64) -> Result<(), CacheError> {
        if len > 0 {
            self.retrieve()?;
        }
        if self.fd.is_none() {
            let (fd, temp_path) = new_temp_file(&self.temp_dir)?;
            self.fd = Some(fd);
            self.temp_path = Some(temp_path);
        }
        self.fd.as_mut().expect("populated above").set_len(len)?;
        self.dirty = true;
        self.flush()?;
        Ok(())
    }

    pub fn len(&self) -> std::io::Result<u64> {
        match &self.fd {
            Some(fd) => Ok(fd.metadata()?.len()),
            None => Ok(0),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// §4.D `flush()`: no-op if clean; no-op if unlinked (`path == null`);
    /// otherwise remove any existing remote object at `path` (default
    /// `conflict=strict` on `file_add` fails when the path is occupied —
    /// a cached overwrite semantically replaces it) and re-upload.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let fd = self.fd.as_mut().expect("dirty implies fd present");
        fd.seek(SeekFrom::Start(0))?;
        let upload_source = fd.try_clone()?;

        if !matches!(self.remote.file_exists(&path)?, Existence::Absent) {
            self.remote.file_remove(&path)?;
        }
        let blob = self.remote.blob_upload(upload_source)?;
        self.remote.file_add(&path, &blob, Conflict::Strict)?;
        self.dirty = false;
        Ok(())
    }

    /// §4.D `close()`: release the scratch. Does not flush — callers flush
    /// explicitly first (§4.E `release`: "flush; dec_ref; if zero refs,
    /// close").
    pub fn close(self) {
        if let Some(temp_path) = &self.temp_path {
            if let Err(e) = std::fs::remove_file(temp_path) {
                log::warn!("removing temp cache file {}: {e}", temp_path.display());
            }
        }
    }
}

fn new_temp_file(temp_dir: &std::path::Path) -> Result<(File, PathBuf), std::io::Error> {
    std::fs::create_dir_all(temp_dir)?;
    let named = tempfile::NamedTempFile::new_in(temp_dir)?;
    named.keep().map_err(|e| e.error)
}
