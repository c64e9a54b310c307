use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a [`DownloadError`], used for retry decisions and
/// for the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Network,
    Timeout,
    ProxyProtocol,
    ProxyAuth,
    Kerberos,
    NotFound,
    AmbiguousMatch,
    Auth,
    LinkExpired,
    ChunkFailed,
    Integrity,
    Io,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::ProxyProtocol => "ProxyProtocolError",
            ErrorKind::ProxyAuth => "ProxyAuthError",
            ErrorKind::Kerberos => "KerberosError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::AmbiguousMatch => "AmbiguousMatchError",
            ErrorKind::Auth => "AuthError",
            ErrorKind::LinkExpired => "LinkExpired",
            ErrorKind::ChunkFailed => "ChunkFailed",
            ErrorKind::Integrity => "IntegrityError",
            ErrorKind::Io => "IOError",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// Exit status of the CLI when a download fails with this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Config => 1,
            ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::ProxyProtocol
            | ErrorKind::ProxyAuth
            | ErrorKind::LinkExpired
            | ErrorKind::ChunkFailed
            | ErrorKind::Io => 2,
            ErrorKind::Kerberos => 3,
            ErrorKind::NotFound | ErrorKind::AmbiguousMatch | ErrorKind::Auth => 4,
            ErrorKind::Integrity => 5,
            ErrorKind::Cancelled => 130,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the download pipeline can surface.
///
/// Messages never carry credentials or signed query strings; callers that
/// format URLs into a variant go through [`crate::util::redact_url`].
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("proxy protocol error: {0}")]
    ProxyProtocol(String),

    #[error("proxy authentication failed: {0}")]
    ProxyAuth(String),

    #[error("kerberos error: {0}")]
    Kerberos(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    AmbiguousMatch {
        message: String,
        candidates: Vec<String>,
    },

    #[error("artifact service rejected the request: {0}")]
    Auth(String),

    #[error("download link expired and could not be refreshed")]
    LinkExpired,

    #[error("chunk {id} failed after {attempts} attempt(s): {reason}")]
    ChunkFailed {
        id: usize,
        attempts: u32,
        reason: String,
    },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Config(_) => ErrorKind::Config,
            DownloadError::Network(_) => ErrorKind::Network,
            DownloadError::Timeout(_) => ErrorKind::Timeout,
            DownloadError::ProxyProtocol(_) => ErrorKind::ProxyProtocol,
            DownloadError::ProxyAuth(_) => ErrorKind::ProxyAuth,
            DownloadError::Kerberos(_) => ErrorKind::Kerberos,
            DownloadError::NotFound(_) => ErrorKind::NotFound,
            DownloadError::AmbiguousMatch { .. } => ErrorKind::AmbiguousMatch,
            DownloadError::Auth(_) => ErrorKind::Auth,
            DownloadError::LinkExpired => ErrorKind::LinkExpired,
            DownloadError::ChunkFailed { .. } => ErrorKind::ChunkFailed,
            DownloadError::Integrity(_) => ErrorKind::Integrity,
            DownloadError::Io { .. } => ErrorKind::Io,
            DownloadError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Transport-level failures a chunk may retry within its budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, DownloadError::Network(_) | DownloadError::Timeout(_))
    }
}

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;
