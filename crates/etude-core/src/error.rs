use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
///
/// Only failures that stop the server from starting or running surface here.
/// Per-connection protocol and I/O problems never leave the connection; they
/// turn into an HTTP status or a close decision instead.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration value (pool size, queue bound, document root...).
    #[error("configuration error: {0}")]
    Config(String),

    /// The listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// The Ctrl-C handler could not be installed.
    #[error("signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),
}

impl EtudeError {
    pub fn config(msg: impl Into<String>) -> Self {
        EtudeError::Config(msg.into())
    }
}

pub type EtudeResult<T> = Result<T, EtudeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = EtudeError::config("workers must be positive");
        assert_eq!(err.to_string(), "configuration error: workers must be positive");
    }

    #[test]
    fn io_error_converts() {
        let err: EtudeError = io::Error::from(io::ErrorKind::AddrInUse).into();
        assert!(matches!(err, EtudeError::Io(_)));
    }
}
