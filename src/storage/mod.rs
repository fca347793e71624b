//! Blob storage abstraction / 存储后端抽象
//!
//! A [`BlobBackend`] only knows how to move one chunk at a time and how to
//! read remote metadata. Everything that is the same across backends (chunk
//! planning, temp files, encryption, cleanup) lives in [`client::StorageClient`].

pub mod client;
pub mod credential;
pub mod http;
pub mod manager;
pub mod retry;

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::compression::CompressionType;
use crate::encryption::EncryptionMetadata;
use crate::error::TransferError;
use crate::transfer::{CommandExecutor, CommandType};

pub use client::StorageClient;
pub use credential::{CredentialRefresher, StorageCredential};
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use manager::{BackendFactory, BackendRegistry};
pub use retry::{ExpiryClassifier, RequestRetrier, RetryKey, RetryPolicy};

/// 进度回调类型 / Progress callback type
/// 参数: (文件名, 已完成字节数, 总字节数) / Parameters: (file name, completed_bytes, total_bytes)
pub type ProgressCallback = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

/// Stage location type / 存储位置类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageLocationType {
    #[serde(rename = "LOCAL_FS")]
    LocalFs,
    #[serde(rename = "S3")]
    S3,
    #[serde(rename = "AZURE")]
    Azure,
    #[serde(rename = "GCS")]
    Gcs,
}

impl StageLocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageLocationType::LocalFs => "LOCAL_FS",
            StageLocationType::S3 => "S3",
            StageLocationType::Azure => "AZURE",
            StageLocationType::Gcs => "GCS",
        }
    }
}

impl fmt::Display for StageLocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageLocationType {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LOCAL_FS" => Ok(StageLocationType::LocalFs),
            "S3" => Ok(StageLocationType::S3),
            "AZURE" => Ok(StageLocationType::Azure),
            "GCS" => Ok(StageLocationType::Gcs),
            _ => Err(TransferError::InvalidStageLocationType(s.to_string())),
        }
    }
}

/// Stage descriptor from the transfer response / 传输响应中的存储描述
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageInfo {
    pub location_type: String,
    /// `bucket/path/`, `container/path/` or a local directory
    pub location: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub creds: HashMap<String, String>,
    #[serde(default)]
    pub end_point: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub storage_account: Option<String>,
    #[serde(default)]
    pub is_client_side_encrypted: bool,
    #[serde(default)]
    pub use_s3_regional_url: bool,
    #[serde(default)]
    pub presigned_url: Option<String>,
}

/// Split a location into its container and a path prefix ending in `/`
/// 拆分存储位置为桶/容器与路径前缀
pub fn split_location(location: &str) -> (String, String) {
    let location = location.trim_start_matches('/');
    match location.find('/') {
        Some(idx) => {
            let container = location[..idx].to_string();
            let mut path = location[idx + 1..].to_string();
            if !path.is_empty() && !path.ends_with('/') {
                path.push('/');
            }
            (container, path)
        }
        None => (location.to_string(), String::new()),
    }
}

/// Remote object metadata / 远程对象元数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileHeader {
    pub digest: Option<String>,
    pub content_length: Option<u64>,
    pub encryption_metadata: Option<EncryptionMetadata>,
}

/// What a backend needs to know about the file being uploaded / 上传上下文
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub dst_file_name: String,
    pub digest: String,
    pub upload_size: u64,
    pub num_chunks: u64,
    pub encryption_metadata: Option<EncryptionMetadata>,
    pub dst_compression_type: Option<&'static CompressionType>,
}

impl UploadContext {
    pub fn is_multipart(&self) -> bool {
        self.num_chunks > 1
    }
}

/// What a backend needs to know about the file being downloaded / 下载上下文
#[derive(Debug, Clone)]
pub struct DownloadContext {
    pub src_file_name: String,
    pub file_size: u64,
}

/// Everything a factory needs to build one per-file backend / 构建后端所需的上下文
#[derive(Clone)]
pub struct StageContext {
    pub stage_info: Arc<StageInfo>,
    pub credential: Arc<StorageCredential>,
    pub transport: Arc<dyn HttpTransport>,
    pub retry_policy: RetryPolicy,
    pub command_type: CommandType,
    pub use_s3_regional_url: bool,
    /// Presigned URL for this file (GCS only) / 该文件的预签名URL
    pub presigned_url: Option<String>,
    /// Destination name used when a presigned URL has to be renewed
    pub dst_file_name: String,
    /// Original command, re-executed to renew presigned URLs / 原始命令
    pub command: String,
    pub executor: Option<Arc<dyn CommandExecutor>>,
}

/// Storage backend trait / 存储后端 trait
///
/// One instance serves exactly one file. Multipart handles (upload ids,
/// part ETags, block ids) are kept inside the backend.
#[async_trait]
pub trait BlobBackend: ExpiryClassifier {
    /// Backend name for logs / 后端名称
    fn name(&self) -> &'static str;

    /// Whether files may be split into several chunks / 是否支持分片
    fn chunked_transfer(&self) -> bool {
        true
    }

    /// Default chunk size / 默认分片大小
    fn chunk_size(&self) -> u64;

    /// Chunk size for a file of the given size / 按文件大小计算分片大小
    fn chunk_size_for(&self, _file_size: u64) -> Result<u64> {
        Ok(self.chunk_size())
    }

    /// Whether `get_file_header` can be answered before a transfer
    fn supports_head(&self) -> bool {
        true
    }

    /// Probe a remote object, `None` if it does not exist / 获取远程对象元数据
    async fn get_file_header(&self, name: &str) -> Result<Option<FileHeader>>;

    /// Decide whether to use an accelerated endpoint / 是否使用加速端点
    async fn transfer_accelerate_config(&self, _use_accelerate: Option<bool>) -> Result<bool> {
        Ok(false)
    }

    async fn initiate_multipart_upload(&self, ctx: &UploadContext) -> Result<()>;

    /// Upload one chunk; a single-chunk upload is a plain PUT / 上传单个分片
    async fn upload_chunk(&self, ctx: &UploadContext, chunk_id: u64, data: Bytes) -> Result<()>;

    async fn complete_multipart_upload(&self, ctx: &UploadContext) -> Result<()>;

    async fn abort_multipart_upload(&self, ctx: &UploadContext) -> Result<()>;

    /// Download one chunk; `None` fetches the whole object / 下载单个分片
    async fn download_chunk(
        &self,
        ctx: &DownloadContext,
        chunk_id: u64,
        range: Option<Range<u64>>,
    ) -> Result<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_type_parse() {
        assert_eq!("s3".parse::<StageLocationType>().unwrap(), StageLocationType::S3);
        assert_eq!("LOCAL_FS".parse::<StageLocationType>().unwrap(), StageLocationType::LocalFs);
        let err = "HDFS".parse::<StageLocationType>().unwrap_err();
        assert!(matches!(err, TransferError::InvalidStageLocationType(ref t) if t == "HDFS"));
    }

    #[test]
    fn test_split_location() {
        assert_eq!(split_location("bucket/a/b"), ("bucket".to_string(), "a/b/".to_string()));
        assert_eq!(split_location("bucket/a/"), ("bucket".to_string(), "a/".to_string()));
        assert_eq!(split_location("bucket"), ("bucket".to_string(), String::new()));
        assert_eq!(split_location("bucket/"), ("bucket".to_string(), String::new()));
    }

    #[test]
    fn test_stage_info_deserialize() {
        let info: StageInfo = serde_json::from_str(
            r#"{"locationType":"S3","location":"bucket/stage/","region":"us-west-2",
                "creds":{"AWS_KEY_ID":"k","AWS_SECRET_KEY":"s"},"useS3RegionalUrl":true}"#,
        ).unwrap();
        assert_eq!(info.location_type, "S3");
        assert_eq!(info.region.as_deref(), Some("us-west-2"));
        assert_eq!(info.creds.get("AWS_KEY_ID").map(|s| s.as_str()), Some("k"));
        assert!(info.use_s3_regional_url);
        assert!(info.end_point.is_none());
    }
}
