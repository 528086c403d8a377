//! Error types for the media cache engine.

use thiserror::Error;

/// Result type alias using CacheError.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur in media cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Range errors
    #[error("Out of range: {0}")]
    OutOfRange(String),

    // Unsupported operations
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // Allocation errors
    #[error("Out of memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    // Read misses
    #[error("Content not cached at position {position}")]
    NotCached { position: u64 },

    // Corruption
    #[error("Container corrupted: {0}")]
    Corrupt(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let cache_err: CacheError = io_err.into();
        assert!(matches!(cache_err, CacheError::Io(_)));
        assert!(cache_err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_out_of_range_display() {
        let err = CacheError::OutOfRange("cache full".to_string());
        assert_eq!(err.to_string(), "Out of range: cache full");
    }

    #[test]
    fn test_unsupported_display() {
        let err = CacheError::Unsupported("overwrite of stored content".to_string());
        assert_eq!(
            err.to_string(),
            "Unsupported operation: overwrite of stored content"
        );
    }

    #[test]
    fn test_out_of_memory_display() {
        let err = CacheError::OutOfMemory { requested: 4096 };
        assert_eq!(
            err.to_string(),
            "Out of memory: failed to allocate 4096 bytes"
        );
    }

    #[test]
    fn test_not_cached_display() {
        let err = CacheError::NotCached { position: 100 };
        assert_eq!(err.to_string(), "Content not cached at position 100");
    }

    #[test]
    fn test_corrupt_display() {
        let err = CacheError::Corrupt("bad signature".to_string());
        assert_eq!(err.to_string(), "Container corrupted: bad signature");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(CacheError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CacheError>();
    }
}
