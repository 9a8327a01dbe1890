//! Error types for the range cache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the throttle and cache-store layers
#[derive(Error, Debug)]
pub enum Error {
    /// Error reported by the backing file, passed through verbatim
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device error after part of a split transfer already completed
    #[error("I/O error after {transferred} bytes: {source}")]
    PartialTransfer {
        transferred: usize,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Cache Store Errors
    // =========================================================================
    /// The cache pool reported no free capacity
    #[error("Cache capacity exhausted")]
    CacheFull,

    /// Extent map query against the backing file failed
    #[error("Extent query failed at offset {offset} size {size}: {source}")]
    ExtentQuery {
        offset: u64,
        size: u64,
        #[source]
        source: std::io::Error,
    },

    /// Extent map for the window does not fit the query buffer
    #[error("Extent query at offset {offset} size {size} returned {limit} or more extents")]
    TooManyExtents { offset: u64, size: u64, limit: usize },

    // =========================================================================
    // Throttle Errors
    // =========================================================================
    /// A statistics queue stayed full for longer than the caller allowed
    #[error("Statistics queue still full after {waited:?}")]
    QueueTimeout { waited: Duration },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for both pool-level capacity rejection and device ENOSPC.
    pub fn is_no_space(&self) -> bool {
        match self {
            Error::CacheFull => true,
            Error::Io(e) | Error::PartialTransfer { source: e, .. } => is_enospc(e),
            _ => false,
        }
    }

    /// Unwrap an error that crossed an `io::Error` boundary.
    ///
    /// A [`Error::PartialTransfer`] carried inside the `io::Error` comes back
    /// as itself; anything else becomes [`Error::Io`].
    pub fn from_io(err: std::io::Error) -> Self {
        let wrapped = err.get_ref().map_or(false, |inner| inner.is::<Error>());
        if !wrapped {
            return Error::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(inner)) => Error::Io(std::io::Error::new(kind, inner)),
            None => Error::Io(kind.into()),
        }
    }
}

/// Whether an I/O error means the device ran out of space.
///
/// Looks through a wrapped [`Error::PartialTransfer`] to its device error.
pub fn is_enospc(err: &std::io::Error) -> bool {
    if err.raw_os_error() == Some(libc::ENOSPC) {
        return true;
    }
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<Error>())
        .map_or(false, Error::is_no_space)
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::PartialTransfer {
                transferred,
                source,
            } => {
                let kind = source.kind();
                std::io::Error::new(kind, Error::PartialTransfer { transferred, source })
            }
            Error::CacheFull => std::io::Error::from_raw_os_error(libc::ENOSPC),
            Error::QueueTimeout { .. } => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, err.to_string())
            }
            Error::Config(_) | Error::TooManyExtents { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string())
            }
            Error::ExtentQuery { source, .. } => source,
        }
    }
}
