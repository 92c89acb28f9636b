//! Error types for the extent storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExtentError>;

#[derive(Error, Debug)]
pub enum ExtentError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Truncated file: {0}")]
    Truncated(String),

    #[error("Corrupt trailer: {0}")]
    CorruptTrailer(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Unknown extent type: {0}")]
    UnknownType(String),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pipeline aborted")]
    Aborted,

    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),
}

impl ExtentError {
    /// Stable error code, used by the CLI tools and in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ExtentError::Schema(_) => "SCHEMA_ERROR",
            ExtentError::CorruptData(_) => "CORRUPT_DATA",
            ExtentError::Truncated(_) => "TRUNCATED_FILE",
            ExtentError::CorruptTrailer(_) => "CORRUPT_TRAILER",
            ExtentError::Usage(_) => "USAGE_ERROR",
            ExtentError::UnknownType(_) => "UNKNOWN_TYPE",
            ExtentError::InvalidFormat(_) => "INVALID_FORMAT",
            ExtentError::Compression(_) => "COMPRESSION_ERROR",
            ExtentError::Aborted => "ABORTED",
            ExtentError::WorkerPanicked(_) => "WORKER_PANICKED",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Only a damaged frame can be skipped; everything else ends the read.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExtentError::CorruptData(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ExtentError::Schema("x".into()).code(), "SCHEMA_ERROR");
        assert_eq!(ExtentError::Truncated("x".into()).code(), "TRUNCATED_FILE");
        let io = ExtentError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.code(), "INTERNAL_ERROR");
        assert_eq!(ExtentError::WorkerPanicked("x".into()).code(), "WORKER_PANICKED");
    }

    #[test]
    fn test_only_corrupt_data_is_recoverable() {
        assert!(ExtentError::CorruptData("crc".into()).is_recoverable());
        assert!(!ExtentError::Truncated("eof".into()).is_recoverable());
        assert!(!ExtentError::CorruptTrailer("bad".into()).is_recoverable());
    }
}
