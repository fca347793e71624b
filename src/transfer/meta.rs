//! Per-file transfer record / 单文件传输记录

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use serde::Serialize;

use crate::compression::CompressionType;
use crate::encryption::EncryptionMaterial;
use crate::storage::StageLocationType;

/// Transfer direction / 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Upload,
    Download,
}

/// File transfer status / 文件传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    NotStarted,
    Uploaded,
    Downloaded,
    Skipped,
    Error,
    NotFoundFile,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::NotStarted => "NOT_STARTED",
            ResultStatus::Uploaded => "UPLOADED",
            ResultStatus::Downloaded => "DOWNLOADED",
            ResultStatus::Skipped => "SKIPPED",
            ResultStatus::Error => "ERROR",
            ResultStatus::NotFoundFile => "NOT_FOUND_FILE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != ResultStatus::NotStarted
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransferMeta {
    /// Display name (base name of the source) / 显示名称
    pub name: String,
    pub src_file_name: String,
    pub dst_file_name: String,
    pub stage_location_type: StageLocationType,

    pub src_compression_type: Option<&'static CompressionType>,
    pub dst_compression_type: Option<&'static CompressionType>,
    pub require_compress: bool,

    pub src_file_size: u64,
    pub upload_size: u64,
    pub sha256_digest: Option<String>,
    /// -1 when a download failed, 0 when an upload failed or was skipped
    pub dst_file_size: i64,

    pub encryption_material: Option<EncryptionMaterial>,

    result_status: ResultStatus,
    /// Outcome of the existence probe, kept apart from the result
    pub remote_status: Option<ResultStatus>,
    pub error_details: Option<String>,

    /// Path actually uploaded after compression / 压缩后的实际源文件
    pub real_src_file_name: Option<PathBuf>,
    pub src_stream: Option<Bytes>,
    pub intermediate_stream: Option<Bytes>,

    pub overwrite: bool,
    pub presigned_url: Option<String>,
    /// Download target directory / 下载目标目录
    pub local_location: Option<PathBuf>,
    pub parallel: usize,
    pub multipart_threshold: u64,
}

impl TransferMeta {
    pub fn new(
        name: impl Into<String>,
        src_file_name: impl Into<String>,
        stage_location_type: StageLocationType,
    ) -> Self {
        Self {
            name: name.into(),
            src_file_name: src_file_name.into(),
            dst_file_name: String::new(),
            stage_location_type,
            src_compression_type: None,
            dst_compression_type: None,
            require_compress: false,
            src_file_size: 0,
            upload_size: 0,
            sha256_digest: None,
            dst_file_size: 0,
            encryption_material: None,
            result_status: ResultStatus::NotStarted,
            remote_status: None,
            error_details: None,
            real_src_file_name: None,
            src_stream: None,
            intermediate_stream: None,
            overwrite: false,
            presigned_url: None,
            local_location: None,
            parallel: 1,
            multipart_threshold: 0,
        }
    }

    pub fn result_status(&self) -> ResultStatus {
        self.result_status
    }

    pub fn is_settled(&self) -> bool {
        self.result_status.is_terminal()
    }

    /// Set the terminal status once / 设置最终状态（只能设置一次）
    ///
    /// Returns `false` and leaves the record untouched when a terminal status
    /// was already recorded.
    pub fn settle(&mut self, status: ResultStatus) -> bool {
        if self.result_status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.result_status = status;
        true
    }

    /// Settle as ERROR with details / 标记为错误
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        if self.settle(ResultStatus::Error) {
            self.error_details = Some(message);
            true
        } else {
            tracing::debug!("{}: ignoring late error after {}: {}", self.name, self.result_status, message);
            false
        }
    }
}
