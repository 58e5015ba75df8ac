use std::fmt;

/// Errors raised by the remote-store client layer (§4.C of the design).
///
/// `ServerError` folds together non-2xx HTTP responses, transport/connection
/// failures, and protocol-level invariant violations the caller raises
/// itself (e.g. a blob-upload size mismatch) — all of these are retried the
/// same way by [`crate::retry::call`].
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("server error: {0}")]
    ServerError(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        RemoteError::ServerError(e.to_string())
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::ServerError(format!("malformed response: {e}"))
    }
}

/// An error the FUSE adapter can hand straight to the kernel via `reply.error(..)`.
#[derive(Debug, Clone, Copy)]
pub struct FuseError(pub i32);

impl FuseError {
    pub const ENOENT: FuseError = FuseError(libc::ENOENT);
    pub const EACCES: FuseError = FuseError(libc::EACCES);
    pub const ENOTSUP: FuseError = FuseError(libc::ENOTSUP);
    pub const EIO: FuseError = FuseError(libc::EIO);
    pub const EBADF: FuseError = FuseError(libc::EBADF);
}

impl fmt::Display for FuseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// Maps a client-layer error onto the errno the kernel sees. Unexpected
/// errors are logged with their origin and surfaced as a generic `EIO`
/// rather than panicking the dispatch loop (per §7: unmodelled failures are
/// logged, not propagated as a specific errno).
impl From<RemoteError> for FuseError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound => FuseError::ENOENT,
            RemoteError::AlreadyExists => {
                log::warn!("unexpected AlreadyExists surfaced to kernel as EIO: {e}");
                FuseError::EIO
            }
            RemoteError::ServerError(msg) => {
                log::error!("remote operation failed: {msg}");
                FuseError::EIO
            }
        }
    }
}
