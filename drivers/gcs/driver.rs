//! GCS backend / GCS驱动
//!
//! Without an access token every file gets its own presigned URL, obtained
//! by re-running the PUT command for that single file. Metadata can then
//! only be learned from our own PUT or GET, so it is cached per file.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::encryption::EncryptionData;
use crate::storage::http::{HttpRequest, HttpResponse, Method};
use crate::storage::{
    split_location, BlobBackend, DownloadContext, ExpiryClassifier, FileHeader, RequestRetrier,
    RetryKey, StageContext, StorageCredential, UploadContext,
};
use crate::transfer::{CommandExecutor, CommandType};

const ENDPOINT: &str = "https://storage.googleapis.com";
const FILE_PROTOCOL: &str = "file://";
const CHUNK_SIZE: u64 = 64 * 1024 * 1024;

const META_DIGEST: &str = "x-goog-meta-sfc-digest";
const META_ENCRYPTION_DATA: &str = "x-goog-meta-encryptiondata";
const META_MATDESC: &str = "x-goog-meta-matdesc";

/// Where a stage lives in GCS / GCS存储位置
#[derive(Debug, Clone, PartialEq)]
pub struct GcsLocation {
    pub bucket: String,
    /// Object name prefix, empty or ending in `/`
    pub prefix: String,
}

impl GcsLocation {
    pub fn from_context(ctx: &StageContext) -> Result<Self> {
        let (bucket, prefix) = split_location(&ctx.stage_info.location);
        if bucket.is_empty() {
            return Err(anyhow!("Missing bucket in stage location: {}", ctx.stage_info.location));
        }
        Ok(Self { bucket, prefix })
    }

    pub fn object_url(&self, name: &str) -> String {
        let object = format!("{}{}", self.prefix, name.trim_start_matches('/'));
        let encoded: Vec<String> = object.split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}/{}", ENDPOINT, self.bucket, encoded.join("/"))
    }
}

fn is_put_statement(command: &str) -> bool {
    command.trim_start()
        .get(..3)
        .map(|head| head.eq_ignore_ascii_case("put"))
        .unwrap_or(false)
}

/// Local path of a PUT command, quoted or not / 从PUT命令中提取本地路径
pub fn local_path_from_put_command(command: &str) -> Option<String> {
    let begin = command.find(FILE_PROTOCOL)?;
    if !is_put_statement(command) {
        return None;
    }
    let quoted = command[..begin].ends_with('\'');
    let rest = &command[begin + FILE_PROTOCOL.len()..];
    let path = if quoted {
        rest.find('\'').map(|end| &rest[..end]).unwrap_or("")
    } else {
        let end = rest.find(|c: char| matches!(c, ' ' | '\n' | ';')).unwrap_or(rest.len());
        &rest[..end]
    };
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

pub struct GcsBackend {
    location: GcsLocation,
    credential: Arc<StorageCredential>,
    retrier: RequestRetrier,
    presigned_url: Mutex<Option<String>>,
    /// Set once the first presigned URL for this file has been requested
    presigned_checked: AtomicBool,
    header_cache: Mutex<Option<FileHeader>>,
    command_type: CommandType,
    dst_file_name: String,
    command: String,
    executor: Option<Arc<dyn CommandExecutor>>,
}

impl GcsBackend {
    pub fn new(location: GcsLocation, ctx: StageContext) -> Self {
        let presigned_url = ctx.presigned_url.clone()
            .or_else(|| ctx.stage_info.presigned_url.clone())
            .filter(|u| !u.is_empty());
        Self {
            location,
            credential: ctx.credential.clone(),
            retrier: RequestRetrier::new(ctx.transport.clone(), ctx.credential.clone(), ctx.retry_policy.clone()),
            presigned_url: Mutex::new(presigned_url),
            presigned_checked: AtomicBool::new(false),
            header_cache: Mutex::new(None),
            command_type: ctx.command_type,
            dst_file_name: ctx.dst_file_name,
            command: ctx.command,
            executor: ctx.executor,
        }
    }

    fn token(&self) -> Option<String> {
        self.credential.get("GCS_ACCESS_TOKEN").filter(|t| !t.is_empty())
    }

    /// Direct object request with the bearer token, if any / 直接访问对象
    fn object_request(&self, method: Method, name: &str) -> HttpRequest {
        let request = HttpRequest::new(method, self.location.object_url(name));
        match self.token() {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Use the presigned URL when there is one / 优先使用预签名URL
    fn request(&self, method: Method, name: &str, headers: &[(String, String)], body: Bytes) -> Result<HttpRequest> {
        let presigned = self.presigned_url.lock().clone();
        let mut request = match presigned {
            Some(url) => HttpRequest::new(method, url),
            None => self.object_request(method, name),
        };
        for (name, value) in headers {
            request.set_header(name.clone(), value.clone());
        }
        Ok(request.body(body))
    }

    fn upload_headers(ctx: &UploadContext) -> Result<Vec<(String, String)>> {
        // GZIP objects are stored without content-encoding so GCS never decompresses them
        let content_encoding = match ctx.dst_compression_type {
            Some(c) if c.name != "GZIP" => c.name.to_lowercase(),
            _ => String::new(),
        };
        let mut headers = vec![
            ("content-encoding".to_string(), content_encoding),
            (META_DIGEST.to_string(), ctx.digest.clone()),
        ];
        if let Some(meta) = &ctx.encryption_metadata {
            headers.push((META_ENCRYPTION_DATA.to_string(), EncryptionData::new(meta, "AES_CBC_256").to_json()?));
            headers.push((META_MATDESC.to_string(), meta.matdesc.clone()));
        }
        Ok(headers)
    }

    fn header_from_response(resp: &HttpResponse, content_length: Option<u64>) -> Result<FileHeader> {
        let encryption_metadata = match resp.header(META_ENCRYPTION_DATA) {
            Some(json) if !json.is_empty() && json != "null" => {
                Some(EncryptionData::parse_metadata(json, resp.header(META_MATDESC))?)
            }
            _ => None,
        };
        Ok(FileHeader {
            digest: resp.header(META_DIGEST).map(|d| d.to_string()),
            content_length,
            encryption_metadata,
        })
    }
}

#[async_trait]
impl ExpiryClassifier for GcsBackend {
    fn has_expired_token(&self, response: &HttpResponse) -> bool {
        self.token().is_some() && response.status == 401
    }

    fn has_expired_presigned_url(&self, response: &HttpResponse) -> bool {
        self.token().is_none() && response.status == 400
    }

    async fn update_presigned_url(&self) -> Result<()> {
        // GET commands carry no local path and keep their URLs
        if self.command_type == CommandType::Download {
            return Ok(());
        }
        let Some(local_path) = local_path_from_put_command(&self.command) else {
            return Ok(());
        };
        let executor = self.executor.as_ref()
            .ok_or_else(|| anyhow!("No command executor to renew the presigned URL of {}", self.dst_file_name))?;

        let command = self.command.replace(&local_path, &self.dst_file_name);
        tracing::debug!("Getting presigned URL for {}", self.dst_file_name);
        let response = executor.execute(&command).await?;
        let url = response.data
            .and_then(|d| d.stage_info.presigned_url)
            .filter(|u| !u.is_empty());
        *self.presigned_url.lock() = url;
        Ok(())
    }
}

#[async_trait]
impl BlobBackend for GcsBackend {
    fn name(&self) -> &'static str {
        "gcs"
    }

    fn chunked_transfer(&self) -> bool {
        false
    }

    fn chunk_size(&self) -> u64 {
        CHUNK_SIZE
    }

    fn supports_head(&self) -> bool {
        self.token().is_some()
    }

    async fn get_file_header(&self, name: &str) -> Result<Option<FileHeader>> {
        if let Some(header) = self.header_cache.lock().clone() {
            return Ok(Some(header));
        }
        if self.token().is_none() {
            return Ok(None);
        }

        let resp = self.retrier
            .send(RetryKey::Head, self, || Ok(self.object_request(Method::HEAD, name)))
            .await?;
        if resp.status == 404 {
            return Ok(None);
        }
        let resp = resp.error_for_status(&format!("HEAD {}", name))?;
        let content_length = resp.header("content-length").and_then(|l| l.parse().ok());
        Ok(Some(Self::header_from_response(&resp, content_length)?))
    }

    async fn initiate_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        Err(anyhow!("GCS uploads are not split into chunks: {}", ctx.dst_file_name))
    }

    async fn upload_chunk(&self, ctx: &UploadContext, chunk_id: u64, data: Bytes) -> Result<()> {
        if self.token().is_none() && !self.presigned_checked.swap(true, Ordering::SeqCst) {
            tracing::debug!("No access token for GCS, requesting a presigned URL");
            self.update_presigned_url().await?;
        }

        let headers = Self::upload_headers(ctx)?;
        self.retrier
            .send(RetryKey::Chunk(chunk_id), self, || {
                self.request(Method::PUT, &ctx.dst_file_name, &headers, data.clone())
            })
            .await?
            .error_for_status(&format!("PUT {}", ctx.dst_file_name))?;

        *self.header_cache.lock() = Some(FileHeader {
            digest: Some(ctx.digest.clone()),
            content_length: Some(ctx.upload_size),
            encryption_metadata: ctx.encryption_metadata.clone(),
        });
        Ok(())
    }

    async fn complete_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        Err(anyhow!("GCS uploads are not split into chunks: {}", ctx.dst_file_name))
    }

    async fn abort_multipart_upload(&self, _ctx: &UploadContext) -> Result<()> {
        Ok(())
    }

    async fn download_chunk(
        &self,
        ctx: &DownloadContext,
        chunk_id: u64,
        _range: Option<Range<u64>>,
    ) -> Result<Bytes> {
        let resp = self.retrier
            .send(RetryKey::Chunk(chunk_id), self, || {
                self.request(Method::GET, &ctx.src_file_name, &[], Bytes::new())
            })
            .await?
            .error_for_status(&format!("GET {}", ctx.src_file_name))?;

        let header = Self::header_from_response(&resp, Some(resp.body.len() as u64))?;
        *self.header_cache.lock() = Some(header);
        Ok(resp.body)
    }
}
