//! Transfer error types / 传输错误类型
//!
//! Pre-flight failures are reported as typed variants before any file moves.
//! Backend and I/O failures of a single file never surface here; they are
//! attached to that file's result row instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Unknown stage location type: {0}")]
    InvalidStageLocationType(String),

    #[error("Unknown command type: {0}")]
    InvalidCommandType(String),

    #[error("File doesn't exist: {0}")]
    FileNotExists(String),

    #[error("Not a file but a directory: {0}")]
    NotAFile(String),

    #[error("The local path is not a directory: {0}")]
    LocalPathNotDirectory(String),

    #[error("Number of encryption materials ({materials}) does not match number of files ({files})")]
    EncryptionMaterialMismatch { files: usize, materials: usize },

    #[error("Feature is not supported: compression type {0}")]
    CompressionNotSupported(String),

    #[error("Compression type not found: {0}")]
    UnknownCompressionType(String),

    #[error("Invalid transfer request: {0}")]
    InvalidRequest(String),

    /// A worker failed in a way that aborts the whole invocation / 致命错误
    #[error("Transfer aborted: {0}")]
    Fatal(String),

    #[error("{failed} of {total} files failed to transfer, first error: {first}")]
    FilesFailed { failed: usize, total: usize, first: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether the error was raised before any transfer started / 是否为预检错误
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidStageLocationType(_)
                | TransferError::InvalidCommandType(_)
                | TransferError::FileNotExists(_)
                | TransferError::NotAFile(_)
                | TransferError::LocalPathNotDirectory(_)
                | TransferError::EncryptionMaterialMismatch { .. }
                | TransferError::CompressionNotSupported(_)
                | TransferError::UnknownCompressionType(_)
                | TransferError::InvalidRequest(_)
        )
    }
}
