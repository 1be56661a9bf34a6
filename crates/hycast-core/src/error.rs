//! Error types shared across the engine.
//!
//! Four kinds are distinguished, matching who is at fault:
//! `InvalidArgument` for caller pre-condition violations, `Logic` for
//! contract violations by a collaborator (an undrained latent chunk, an
//! unsupported protocol version), `System` for I/O and OS failures, and
//! `Runtime` for malformed data arriving off the wire.

/// Convenience alias used throughout the library crates.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller violated a pre-condition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A collaborator violated a contract.
    #[error("logic error: {0}")]
    Logic(String),

    /// An I/O or OS failure.
    #[error("system error: {0}")]
    System(#[from] std::io::Error),

    /// Malformed wire data.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Error::Logic(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_detail() {
        let err = Error::invalid_argument("chunk index 9 out of range");
        assert!(err.to_string().contains("invalid argument"));
        assert!(err.to_string().contains("chunk index 9"));
    }

    #[test]
    fn io_errors_convert_to_system() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io.into();
        assert!(matches!(err, Error::System(_)));
    }
}
