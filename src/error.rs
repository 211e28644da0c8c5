use thiserror::Error;

/// Errors raised while configuring a run or executing a single request.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid job or CLI configuration, reported before any request is sent
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid proxy address \"{0}\"")]
    InvalidProxy(String),

    /// Transport or per-request failure (DNS, connect, TLS, timeout, ...)
    #[error(transparent)]
    Http(#[from] isahc::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The reporter task panicked or was cancelled before it finished draining
    #[error("reporter failed: {0}")]
    Reporter(String),
}

impl Error {
    /// Whether the request deadline was exceeded.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Http(err) => matches!(err.kind(), isahc::error::ErrorKind::Timeout),
            Error::Io(err) => err.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
