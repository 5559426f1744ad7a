//! Error types for retroterm.

use thiserror::Error;

/// Common error type for retroterm.
#[derive(Error, Debug)]
pub enum RetroTermError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection error (resolve/connect failures).
    #[error("connection error: {0}")]
    Connection(String),

    /// File transfer error.
    #[error("transfer error: {0}")]
    Transfer(#[from] crate::transfer::TransferError),
}

/// Result type alias for retroterm operations.
pub type Result<T> = std::result::Result<T, RetroTermError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = RetroTermError::Config("bad port".to_string());
        assert_eq!(err.to_string(), "configuration error: bad port");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RetroTermError = io_err.into();
        assert!(matches!(err, RetroTermError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_transfer_error_conversion() {
        let err: RetroTermError = crate::transfer::TransferError::Cancelled.into();
        assert!(matches!(err, RetroTermError::Transfer(_)));
    }

    #[test]
    fn test_result_alias() {
        fn sample_ok() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(sample_ok().unwrap(), 42);
    }
}
