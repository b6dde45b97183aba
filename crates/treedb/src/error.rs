//! Error taxonomy for server-side listen failures.
//!
//! Internal invariant breaches abort via assertions; everything the server
//! can legitimately report is translated into cancel events carrying a
//! [`CancelError`]. The core never returns `Err` out of an `apply_*` call.

use thiserror::Error;

/// Why a server subscription was torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CancelError {
    #[error("permission_denied")]
    PermissionDenied,
    #[error("unavailable")]
    Unavailable,
    #[error("expired")]
    Expired,
    #[error("{0}")]
    Other(String),
}

impl CancelError {
    /// Maps a wire status code to an error. Unrecognized codes are carried
    /// through verbatim.
    pub fn from_status(status: &str) -> CancelError {
        match status {
            "permission_denied" => CancelError::PermissionDenied,
            "unavailable" => CancelError::Unavailable,
            "expired" => CancelError::Expired,
            other => CancelError::Other(other.to_string()),
        }
    }
}
