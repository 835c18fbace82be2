use std::io;

use thiserror::Error;

/// An error that happens while making a symbol archive available locally.
///
/// [`InternalError`](Self::InternalError) hides details that are none of the
/// report's business; they are logged at the point of conversion instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The archive was not found at the remote source.
    #[error("not found")]
    NotFound,
    /// The remote source rejected our credentials.
    ///
    /// The attached string contains the remote source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The transfer failed, e.g. connection loss, DNS resolution, or a 5xx
    /// server response.
    ///
    /// The attached string contains the remote source's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The archive was fetched successfully, but its contents are invalid.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the decoder itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Condenses an error chain down to the message of its root cause.
    pub fn download_error(mut error: &dyn std::error::Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        Self::DownloadError(error.to_string())
    }
}

/// Result of a cache operation, either `Ok(T)` or the reason the symbols are
/// unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
