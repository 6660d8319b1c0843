//! The error type shared by the cache, the providers and the sync engine

use std::path::PathBuf;

use http::Method;
use reqwest::StatusCode;
use url::Url;

pub type CbResult<T> = Result<T, CbError>;

/// The broad families of failures a [`crate::traits::TaskSource`] can report.
///
/// The sync engine only ever branches on kinds, never on concrete variants,
/// so providers are free to carry whatever detail they want in the error itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Credentials were rejected. Not retried by the dispatcher.
    Unauthorized,
    /// The resource is absent. Idempotent success for replayed deletes.
    NotFound,
    /// The resource already exists or has moved.
    Conflict,
    /// A user-supplied value failed validation.
    InvalidInput,
    /// The operation cannot be implemented on this provider.
    Unsupported,
    /// Network error, 5xx or timeout. Retried with a bounded count.
    Transient,
    /// A file changed on disk behind our back.
    ExternalModification,
    /// Anything else a remote answered that we cannot classify better.
    Remote,
}

/// Errors common to the corkboard library
#[derive(thiserror::Error, Debug)]
pub enum CbError {
    #[error("Credentials rejected by {context}. Check the keyring, CORKBOARD_* environment variables or the configured URL")]
    Unauthorized { context: String },

    #[error("{what} {id:?} does not exist")]
    NotFound { what: &'static str, id: String },

    #[error("{what} {id:?} already exists or has moved")]
    Conflict { what: &'static str, id: String },

    #[error("Invalid input: {detail}")]
    InvalidInput { detail: String },

    #[error("Operation {operation} is not supported by {provider}")]
    Unsupported {
        operation: &'static str,
        provider: String,
    },

    #[error("No provider registered for {key:?}")]
    UnsupportedProvider { key: String },

    #[error("Transient failure: {detail}")]
    Transient { detail: String },

    #[error("HTTP {method} {url} failed: {source}")]
    HttpRequest {
        url: Url,
        method: Method,
        source: reqwest::Error,
    },

    #[error("Remote answered {status}: {snippet}")]
    Remote { status: StatusCode, snippet: String },

    #[error("{path:?} was modified externally, refusing to overwrite")]
    ExternalModification { path: PathBuf },

    #[error("Storage error on {path:?}: {source}")]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt store {path:?}: {source}")]
    StoreFormat {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Unparseable XML reply: {source}")]
    DomParse {
        text: String,
        source: minidom::Error,
    },

    #[error("Missing element <{el}> in the server reply")]
    MissingDomElement { text: String, el: String },

    #[error("Unparseable iCalendar data for {item}: {detail}")]
    IcalParse { item: String, detail: String },
}

impl CbError {
    pub fn invalid_input<S: ToString>(detail: S) -> Self {
        CbError::InvalidInput {
            detail: detail.to_string(),
        }
    }

    pub fn transient<S: ToString>(detail: S) -> Self {
        CbError::Transient {
            detail: detail.to_string(),
        }
    }

    /// Map an unexpected HTTP reply to the matching error family.
    ///
    /// 401/403 are authentication problems, 404 is an absent resource, 405 means
    /// the resource exists or has moved, 408/429 and every 5xx are worth a retry.
    pub fn from_status(status: StatusCode, context: &'static str, id: &str, body: &str) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CbError::Unauthorized {
                context: context.to_string(),
            },
            StatusCode::NOT_FOUND => CbError::NotFound {
                what: context,
                id: id.to_string(),
            },
            StatusCode::METHOD_NOT_ALLOWED => CbError::Conflict {
                what: context,
                id: id.to_string(),
            },
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => CbError::Transient {
                detail: format!("{} answered {}", context, status),
            },
            s if s.is_server_error() => CbError::Transient {
                detail: format!("{} answered {}", context, s),
            },
            s => CbError::Remote {
                status: s,
                snippet: snippet(body),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CbError::Unauthorized { .. } => ErrorKind::Unauthorized,
            CbError::NotFound { .. } => ErrorKind::NotFound,
            CbError::Conflict { .. } => ErrorKind::Conflict,
            CbError::InvalidInput { .. } => ErrorKind::InvalidInput,
            CbError::Unsupported { .. } | CbError::UnsupportedProvider { .. } => {
                ErrorKind::Unsupported
            }
            CbError::Transient { .. } => ErrorKind::Transient,
            // A transport-level failure (refused connection, timed out socket) is
            // always worth retrying; status-code cases were mapped before this point.
            CbError::HttpRequest { .. } => ErrorKind::Transient,
            CbError::Storage { .. } => ErrorKind::Transient,
            CbError::ExternalModification { .. } => ErrorKind::ExternalModification,
            CbError::Remote { status, .. } => {
                if status.is_server_error() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Remote
                }
            }
            CbError::StoreFormat { .. }
            | CbError::DomParse { .. }
            | CbError::MissingDomElement { .. }
            | CbError::IcalParse { .. } => ErrorKind::Remote,
        }
    }

    /// Whether the dispatcher should keep the journal entry queued and try again later
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// A process exit code that is consistent across CLI commands
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::InvalidInput => 2,
            ErrorKind::Unauthorized => 3,
            ErrorKind::NotFound => 4,
            _ => 1,
        }
    }
}

/// Truncate a response body to something that fits on a log line
pub(crate) fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let unauthorized = CbError::from_status(StatusCode::FORBIDDEN, "server", "x", "");
        assert_eq!(unauthorized.kind(), ErrorKind::Unauthorized);

        let not_found = CbError::from_status(StatusCode::NOT_FOUND, "task", "t1", "");
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let moved = CbError::from_status(StatusCode::METHOD_NOT_ALLOWED, "list", "l1", "");
        assert_eq!(moved.kind(), ErrorKind::Conflict);

        let flaky = CbError::from_status(StatusCode::BAD_GATEWAY, "server", "x", "");
        assert!(flaky.is_retryable());

        let other = CbError::from_status(StatusCode::IM_A_TEAPOT, "server", "x", "short and stout");
        assert_eq!(other.kind(), ErrorKind::Remote);
        assert!(!other.is_retryable());
    }

    #[test]
    fn snippets_are_bounded() {
        let long = "x".repeat(5000);
        assert!(snippet(&long).len() < 250);
        assert_eq!(snippet("tiny"), "tiny");
    }
}
