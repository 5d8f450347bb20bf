use std::collections::BTreeMap;
use std::io;

/// Error type for fetch and store operations.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid address: {0}")]
    Address(String),

    /// A server- or cache-recorded HTTP failure, durable enough to have
    /// been persisted as a sidecar.
    #[error("{status} {message}")]
    Cached {
        status: u16,
        message: String,
        headers: BTreeMap<String, String>,
    },

    /// The access policy of the request forbids the only applicable
    /// strategy.
    #[error("access denied: {0}")]
    AccessDenied(&'static str),

    #[error("no fetch strategy accepted {0}")]
    NotHandled(String),

    #[error("fetch aborted")]
    Aborted,
}

impl FetchError {
    pub(crate) fn too_many_redirects(status: u16) -> Self {
        FetchError::Cached {
            status,
            message: "Too many redirects".to_string(),
            headers: BTreeMap::new(),
        }
    }

    /// HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Cached { status, .. } => Some(*status),
            FetchError::AccessDenied(_) => Some(403),
            FetchError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// I/O error kind, the errno-style half of the error taxonomy.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            FetchError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// Whether this error is an authoritative cached HTTP failure that
    /// should short-circuit the strategy pipeline.
    pub fn is_cached(&self) -> bool {
        matches!(self, FetchError::Cached { .. })
    }

    /// Whether the failure is worth retrying with backoff.
    ///
    /// Covers connection/timeout classes on the HTTP side and the
    /// equivalent kinds on raw I/O (connection refused/reset, host
    /// unreachable, broken pipe, timed out).
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            FetchError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
