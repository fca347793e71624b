//! Azure Blob backend / Azure Blob驱动
//!
//! - Single chunk: `PUT` a BlockBlob with metadata headers
//! - Multi chunk: one `PUT ?comp=block` per chunk, committed with a block list
//! - Download: ranged GET per chunk

use std::ops::Range;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;

use crate::encryption::EncryptionData;
use crate::storage::http::{HttpRequest, HttpResponse, Method};
use crate::storage::{
    split_location, BlobBackend, DownloadContext, ExpiryClassifier, FileHeader, RequestRetrier,
    RetryKey, StageContext, StorageCredential, UploadContext,
};

const CHUNK_SIZE: u64 = 4 * 1024 * 1024; // 4MB per block
const DEFAULT_ENDPOINT: &str = "core.windows.net";
const API_VERSION: &str = "2021-08-06";

const META_DIGEST: &str = "x-ms-meta-sfcdigest";
const META_ENCRYPTION_DATA: &str = "x-ms-meta-encryptiondata";
const META_MATDESC: &str = "x-ms-meta-matdesc";

const TOKEN_EXPIRATION_MESSAGES: [&str; 2] = [
    "Signature not valid in the specified time frame",
    "Server failed to authenticate the request.",
];

/// Where a stage lives in Azure / Azure存储位置
#[derive(Debug, Clone, PartialEq)]
pub struct AzureLocation {
    pub account: String,
    pub endpoint: String,
    pub container: String,
    /// Blob name prefix, empty or ending in `/`
    pub prefix: String,
}

impl AzureLocation {
    pub fn from_context(ctx: &StageContext) -> Result<Self> {
        let info = &ctx.stage_info;
        let account = info.storage_account.clone()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| anyhow!("Missing storageAccount for Azure stage {}", info.location))?;
        let (container, prefix) = split_location(&info.location);
        let endpoint = info.end_point.clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Ok(Self { account, endpoint, container, prefix })
    }

    /// Blob URL without the SAS token / 不含SAS的Blob地址
    pub fn blob_url(&self, name: &str) -> String {
        let blob = format!("{}{}", self.prefix, name.trim_start_matches('/'));
        let encoded: Vec<String> = blob.split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!(
            "https://{}.blob.{}/{}/{}",
            self.account,
            self.endpoint,
            urlencoding::encode(&self.container),
            encoded.join("/")
        )
    }
}

/// 20 random hex characters, a valid fixed-length base64 block id / 生成块ID
fn new_block_id() -> String {
    let bytes: [u8; 10] = rand::thread_rng().gen();
    hex::encode(bytes)
}

pub struct AzureBackend {
    location: AzureLocation,
    credential: Arc<StorageCredential>,
    retrier: RequestRetrier,
    block_ids: Mutex<Vec<String>>,
}

impl AzureBackend {
    pub fn new(location: AzureLocation, ctx: &StageContext) -> Self {
        Self {
            location,
            credential: ctx.credential.clone(),
            retrier: RequestRetrier::new(ctx.transport.clone(), ctx.credential.clone(), ctx.retry_policy.clone()),
            block_ids: Mutex::new(Vec::new()),
        }
    }

    /// Append the current SAS token to `url` / 追加SAS令牌
    fn authorized(&self, method: Method, url: &str, headers: &[(String, String)], body: Bytes) -> Result<HttpRequest> {
        let sas = self.credential.get("AZURE_SAS_TOKEN").unwrap_or_default();
        let sas = sas.trim_start_matches('?');
        let url = match (sas.is_empty(), url.contains('?')) {
            (true, _) => url.to_string(),
            (false, true) => format!("{}&{}", url, sas),
            (false, false) => format!("{}?{}", url, sas),
        };
        let mut request = HttpRequest::new(method, url)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-date", chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string())
            .body(body);
        for (name, value) in headers {
            request.set_header(name.clone(), value.clone());
        }
        Ok(request)
    }

    fn metadata_headers(ctx: &UploadContext) -> Result<Vec<(String, String)>> {
        let mut headers = vec![(META_DIGEST.to_string(), ctx.digest.clone())];
        if let Some(meta) = &ctx.encryption_metadata {
            headers.push((META_ENCRYPTION_DATA.to_string(), EncryptionData::new(meta, "AES_CBC_128").to_json()?));
            headers.push((META_MATDESC.to_string(), meta.matdesc.clone()));
        }
        Ok(headers)
    }
}

#[async_trait]
impl ExpiryClassifier for AzureBackend {
    fn has_expired_token(&self, response: &HttpResponse) -> bool {
        if response.status != 403 {
            return false;
        }
        let body = response.text();
        TOKEN_EXPIRATION_MESSAGES.iter()
            .any(|m| response.reason.contains(m) || body.contains(m))
    }
}

#[async_trait]
impl BlobBackend for AzureBackend {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn chunk_size(&self) -> u64 {
        CHUNK_SIZE
    }

    async fn get_file_header(&self, name: &str) -> Result<Option<FileHeader>> {
        let url = self.location.blob_url(name);
        let resp = self.retrier
            .send(RetryKey::Head, self, || self.authorized(Method::HEAD, &url, &[], Bytes::new()))
            .await?;
        if resp.status == 404 {
            return Ok(None);
        }
        let resp = resp.error_for_status(&format!("HEAD {}", name))?;

        let encryption_metadata = match resp.header(META_ENCRYPTION_DATA) {
            Some(json) if !json.is_empty() && json != "null" => {
                Some(EncryptionData::parse_metadata(json, resp.header(META_MATDESC))?)
            }
            _ => None,
        };
        Ok(Some(FileHeader {
            digest: resp.header(META_DIGEST).map(|d| d.to_string()),
            content_length: resp.header("content-length").and_then(|l| l.parse().ok()),
            encryption_metadata,
        }))
    }

    async fn initiate_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        let ids: Vec<String> = (0..ctx.num_chunks).map(|_| new_block_id()).collect();
        *self.block_ids.lock() = ids;
        Ok(())
    }

    async fn upload_chunk(&self, ctx: &UploadContext, chunk_id: u64, data: Bytes) -> Result<()> {
        let url = self.location.blob_url(&ctx.dst_file_name);

        if !ctx.is_multipart() {
            let mut headers = vec![("x-ms-blob-type".to_string(), "BlockBlob".to_string())];
            headers.extend(Self::metadata_headers(ctx)?);
            self.retrier
                .send(RetryKey::Chunk(chunk_id), self, || self.authorized(Method::PUT, &url, &headers, data.clone()))
                .await?
                .error_for_status(&format!("PUT {}", ctx.dst_file_name))?;
            return Ok(());
        }

        let block_id = self.block_ids.lock().get(chunk_id as usize).cloned()
            .ok_or_else(|| anyhow!("No block id for chunk {}", chunk_id))?;
        let url = format!("{}?comp=block&blockid={}", url, urlencoding::encode(&block_id));
        self.retrier
            .send(RetryKey::Chunk(chunk_id), self, || self.authorized(Method::PUT, &url, &[], data.clone()))
            .await?
            .error_for_status(&format!("Put block {}", chunk_id))?;
        Ok(())
    }

    async fn complete_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        let body = {
            let ids = self.block_ids.lock();
            let latest: String = ids.iter().map(|id| format!("<Latest>{}</Latest>", id)).collect();
            Bytes::from(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>{}</BlockList>", latest))
        };
        let url = format!("{}?comp=blocklist", self.location.blob_url(&ctx.dst_file_name));
        let mut headers = vec![("x-ms-blob-content-encoding".to_string(), "utf-8".to_string())];
        headers.extend(Self::metadata_headers(ctx)?);
        self.retrier
            .send(RetryKey::Complete, self, || self.authorized(Method::PUT, &url, &headers, body.clone()))
            .await?
            .error_for_status("Put block list")?;
        tracing::debug!("Block list of {} committed", ctx.dst_file_name);
        Ok(())
    }

    async fn abort_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        // Uncommitted blocks are garbage collected by the service
        tracing::debug!("Dropping uncommitted blocks of {}", ctx.dst_file_name);
        self.block_ids.lock().clear();
        Ok(())
    }

    async fn download_chunk(
        &self,
        ctx: &DownloadContext,
        chunk_id: u64,
        range: Option<Range<u64>>,
    ) -> Result<Bytes> {
        let url = self.location.blob_url(&ctx.src_file_name);
        let headers: Vec<(String, String)> = range.as_ref()
            .map(|r| vec![("range".to_string(), format!("bytes={}-{}", r.start, r.end.saturating_sub(1)))])
            .unwrap_or_default();
        let resp = self.retrier
            .send(RetryKey::Chunk(chunk_id), self, || self.authorized(Method::GET, &url, &headers, Bytes::new()))
            .await?;
        if resp.status != 200 && resp.status != 206 {
            resp.error_for_status(&format!("GET {}", ctx.src_file_name))?;
            return Err(anyhow!("Unexpected response for {}", ctx.src_file_name));
        }
        Ok(resp.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::encryption::EncryptionMetadata;
    use crate::storage::retry::tests::ScriptedTransport;
    use crate::storage::{RetryPolicy, StageInfo};
    use crate::transfer::CommandType;

    fn backend(transport: Arc<ScriptedTransport>) -> AzureBackend {
        let ctx = StageContext {
            stage_info: Arc::new(StageInfo {
                location_type: "AZURE".to_string(),
                location: "container/stage dir".to_string(),
                storage_account: Some("acct".to_string()),
                ..StageInfo::default()
            }),
            credential: Arc::new(StorageCredential::new(
                HashMap::from([("AZURE_SAS_TOKEN".to_string(), "?sv=2020&sig=abc".to_string())]),
                None,
            )),
            transport,
            retry_policy: RetryPolicy::default(),
            command_type: CommandType::Upload,
            use_s3_regional_url: false,
            presigned_url: None,
            dst_file_name: "a.csv.gz".to_string(),
            command: "PUT".to_string(),
            executor: None,
        };
        AzureBackend::new(AzureLocation::from_context(&ctx).unwrap(), &ctx)
    }

    fn upload_ctx(num_chunks: u64) -> UploadContext {
        UploadContext {
            dst_file_name: "a.csv.gz".to_string(),
            digest: "abc=".to_string(),
            upload_size: 10,
            num_chunks,
            encryption_metadata: Some(EncryptionMetadata {
                key: "k".to_string(),
                iv: "iv".to_string(),
                matdesc: "{}".to_string(),
            }),
            dst_compression_type: None,
        }
    }

    #[test]
    fn test_block_id_shape() {
        let id = new_block_id();
        assert_eq!(id.len(), 20);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_block_id());
    }

    #[test]
    fn test_expired_token_detection() {
        let backend = backend(ScriptedTransport::new(vec![]));
        let by_reason = HttpResponse::new(403).with_reason("Server failed to authenticate the request.");
        assert!(backend.has_expired_token(&by_reason));
        let by_body = HttpResponse::new(403).with_body("<Error>Signature not valid in the specified time frame</Error>");
        assert!(backend.has_expired_token(&by_body));
        assert!(!backend.has_expired_token(&HttpResponse::new(403)));
        assert!(!backend.has_expired_token(&HttpResponse::new(401).with_reason("Server failed to authenticate the request.")));
    }

    #[tokio::test]
    async fn test_head_with_encryption_data() {
        let data = EncryptionData::new(&upload_ctx(1).encryption_metadata.unwrap(), "AES_CBC_128").to_json().unwrap();
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(200)
            .with_header(META_DIGEST, "d1")
            .with_header(META_ENCRYPTION_DATA, data)
            .with_header(META_MATDESC, "{}")
            .with_header("Content-Length", "10"))]);
        let backend = backend(transport.clone());

        let header = backend.get_file_header("a.csv.gz").await.unwrap().unwrap();
        assert_eq!(header.digest.as_deref(), Some("d1"));
        assert_eq!(header.content_length, Some(10));
        assert_eq!(header.encryption_metadata.unwrap().key, "k");
        assert_eq!(
            transport.requests.lock()[0].url,
            "https://acct.blob.core.windows.net/container/stage%20dir/a.csv.gz?sv=2020&sig=abc"
        );
    }

    #[tokio::test]
    async fn test_head_not_found() {
        let backend = backend(ScriptedTransport::new(vec![Ok(HttpResponse::new(404))]));
        assert!(backend.get_file_header("a.csv.gz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_put_is_block_blob() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(201))]);
        let backend = backend(transport.clone());
        backend.upload_chunk(&upload_ctx(1), 0, Bytes::from_static(b"data")).await.unwrap();

        let request = &transport.requests.lock()[0];
        assert_eq!(request.method, Method::PUT);
        assert_eq!(request.get_header("x-ms-blob-type"), Some("BlockBlob"));
        assert_eq!(request.get_header(META_DIGEST), Some("abc="));
        assert!(request.get_header(META_ENCRYPTION_DATA).unwrap().contains("AES_CBC_128"));
    }

    #[tokio::test]
    async fn test_block_upload_and_commit_in_order() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(201))]);
        let backend = backend(transport.clone());
        let ctx = upload_ctx(3);

        backend.initiate_multipart_upload(&ctx).await.unwrap();
        let ids = backend.block_ids.lock().clone();
        for chunk_id in [2u64, 0, 1] {
            backend.upload_chunk(&ctx, chunk_id, Bytes::from_static(b"x")).await.unwrap();
        }
        backend.complete_multipart_upload(&ctx).await.unwrap();

        let requests = transport.requests.lock();
        assert!(requests[0].url.contains(&format!("?comp=block&blockid={}&sv=2020", ids[2])));
        let commit = &requests[3];
        assert!(commit.url.contains("?comp=blocklist&sv=2020"));
        let body = String::from_utf8(commit.body.to_vec()).unwrap();
        let expected: String = ids.iter().map(|id| format!("<Latest>{}</Latest>", id)).collect();
        assert!(body.contains(&format!("<BlockList>{}</BlockList>", expected)));
        assert_eq!(commit.get_header(META_DIGEST), Some("abc="));
    }
}
