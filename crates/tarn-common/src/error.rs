//! Error types for TarnDB.

use thiserror::Error;

/// Result type alias using TarnError.
pub type Result<T> = std::result::Result<T, TarnError>;

/// Errors that can occur in TarnDB operations.
#[derive(Debug, Error)]
pub enum TarnError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Record errors
    #[error("Malformed record: {0}")]
    InvalidRecord(String),

    // Factory errors
    #[error("Unsupported comparator: {0}")]
    UnsupportedComparator(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = TarnError::Config("missing base_block_size".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing base_block_size");
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = TarnError::InvalidParameter {
            name: "trie_capacity".to_string(),
            value: "0".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parameter: trie_capacity = 0");
    }

    #[test]
    fn test_invalid_record_display() {
        let err = TarnError::InvalidRecord("truncated internal key".to_string());
        assert_eq!(err.to_string(), "Malformed record: truncated internal key");
    }

    #[test]
    fn test_unsupported_comparator_display() {
        let err = TarnError::UnsupportedComparator("custom.ReverseComparator".to_string());
        assert_eq!(
            err.to_string(),
            "Unsupported comparator: custom.ReverseComparator"
        );
    }

    #[test]
    fn test_internal_error_display() {
        let err = TarnError::Internal("assertion failed".to_string());
        assert_eq!(err.to_string(), "Internal error: assertion failed");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(TarnError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TarnError>();
    }
}
