//! Error taxonomy shared by the Fetcher and Dispatcher.
//!
//! These are internal kinds, not wire formats: the dispatcher maps each one
//! onto one of the fixed HTTP responses described in the external interface.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("bad request")]
    BadRequest,
    #[error("referer denied")]
    RefererDenied,
    #[error("upstream returned a non-200 status")]
    UpstreamStatus,
    #[error("upstream transport failure")]
    UpstreamTransport,
    #[error("payload exceeds the configured size cap")]
    TooLarge,
    #[error("payload is not a recognized image format")]
    BadFormat,
    #[error("resize worker failed")]
    ResizeFailed,
    #[error("internal I/O failure")]
    Internal,
}

impl ErrorKind {
    /// Only `TooLarge` detected from headers is persisted as a sticky cache
    /// error; everything else is transient and must be retried.
    pub fn is_sticky(self) -> bool {
        matches!(self, ErrorKind::TooLarge)
    }

    /// The static error asset this kind serves, if any. `BadRequest` and
    /// `RefererDenied` never reach this mapping — they're handled earlier,
    /// directly in the dispatcher.
    pub fn asset_name(self) -> Option<&'static str> {
        match self {
            ErrorKind::TooLarge => Some("toolarge"),
            ErrorKind::BadFormat => Some("badformat"),
            ErrorKind::UpstreamStatus | ErrorKind::UpstreamTransport | ErrorKind::ResizeFailed => {
                Some("cannotread")
            }
            // `Internal` is a local I/O failure and gets a generic 500, not
            // a GIF asset; `BadRequest`/`RefererDenied` are handled earlier,
            // directly by the dispatcher.
            ErrorKind::BadRequest | ErrorKind::RefererDenied | ErrorKind::Internal => None,
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(_: std::io::Error) -> Self {
        ErrorKind::Internal
    }
}
