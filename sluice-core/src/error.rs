//! Error types shared across the sluice crates

use std::io;
use thiserror::Error;

/// Convenience alias used by every fallible sluice API.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for pipes, mailboxes, and process control.
///
/// "Would block" never appears here: it is handled internally by re-arming
/// reactor interest. End-of-stream is not an error either; reads report it
/// as a successful zero-byte completion.
#[derive(Debug, Error)]
pub enum Error {
    /// A pipe, mailbox, or process could not be created. Always fatal and
    /// raised synchronously; no partial object is returned alongside it.
    #[error("failed to create {what}: {source}")]
    Creation {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// An in-flight read or write failed. Scoped to that one operation;
    /// the endpoint remains usable unless [`Error::is_endpoint_broken`]
    /// reports otherwise.
    #[error("transfer failed: {0}")]
    Transfer(#[source] io::Error),

    /// An operation was issued against an endpoint whose handle has
    /// already been closed.
    #[error("endpoint is closed")]
    Closed,

    /// The caller broke the API contract: oversized or empty mailbox
    /// message, NUL byte in an exec argument, and the like.
    #[error("contract violation: {0}")]
    Contract(&'static str),

    /// A process lifecycle query or control call failed.
    #[error("process control failed: {0}")]
    Process(#[source] io::Error),
}

impl Error {
    /// Build a [`Error::Creation`] for the named resource.
    pub fn creation(what: &'static str, source: io::Error) -> Self {
        Error::Creation { what, source }
    }

    /// True when the failure indicates the underlying handle is no longer
    /// valid and the endpoint must be treated as permanently broken.
    pub fn is_endpoint_broken(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Transfer(e) => {
                #[cfg(unix)]
                {
                    e.raw_os_error() == Some(libc::EBADF)
                }
                #[cfg(windows)]
                {
                    // ERROR_INVALID_HANDLE
                    e.raw_os_error() == Some(6)
                }
            }
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transfer(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_endpoint_is_broken() {
        assert!(Error::Closed.is_endpoint_broken());
    }

    #[cfg(unix)]
    #[test]
    fn bad_fd_is_broken_but_other_io_errors_are_not() {
        let bad = Error::Transfer(io::Error::from_raw_os_error(libc::EBADF));
        assert!(bad.is_endpoint_broken());

        let pipe = Error::Transfer(io::Error::from_raw_os_error(libc::EPIPE));
        assert!(!pipe.is_endpoint_broken());
    }

    #[test]
    fn creation_and_contract_are_not_broken_endpoints() {
        let creation = Error::creation("pipe", io::Error::other("boom"));
        assert!(!creation.is_endpoint_broken());
        assert!(!Error::Contract("oversized message").is_endpoint_broken());
    }

    #[test]
    fn display_includes_resource_name() {
        let err = Error::creation("mailbox", io::Error::other("no space"));
        assert!(err.to_string().contains("mailbox"));
    }
}
