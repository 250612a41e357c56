//! Custom error types for the backup daemon.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to create storage client: {0}")]
    ClientInit(String),

    #[error("Failed to open bucket {bucket}: {reason}")]
    Bucket { bucket: String, reason: String },

    #[error("Failed to archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },

    #[error("Failed to close {resource}: {source}")]
    ResourceClose {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn archive(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Archive {
            path: path.into(),
            source,
        }
    }

    pub fn bucket(bucket: &str, reason: impl ToString) -> Self {
        BackupError::Bucket {
            bucket: bucket.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn upload(key: &str, reason: impl ToString) -> Self {
        BackupError::Upload {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short tag naming the failure class, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Config(_) => "ConfigError",
            BackupError::ClientInit(_) => "ClientInitError",
            BackupError::Bucket { .. } => "BucketError",
            BackupError::Archive { .. } => "ArchiveError",
            BackupError::Upload { .. } => "UploadError",
            BackupError::ResourceClose { .. } => "ResourceCloseError",
            BackupError::Io(_) => "IoError",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_tags() {
        let err = BackupError::bucket("photos", "not found");
        assert_eq!(err.kind(), "BucketError");
        assert_eq!(err.to_string(), "Failed to open bucket photos: not found");

        let err = BackupError::archive(
            "/data/a.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind(), "ArchiveError");
        assert!(err.to_string().contains("/data/a.txt"));
    }
}
