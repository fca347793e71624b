//! S3驱动核心实现 / S3 backend
//!
//! - Single chunk: plain PUT with metadata headers
//! - Multi chunk: multipart upload, part ETags kept until completion
//! - Download: ranged GET per chunk
//!
//! Signing goes through `rust-s3`: GET and PUT use presigned URLs, the
//! remaining calls are header-signed. Every attempt signs afresh, so a
//! refreshed token is picked up by the next retry.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::signing;
use s3::Region;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use url::Url;

use crate::encryption::EncryptionMetadata;
use crate::storage::http::{HttpRequest, HttpResponse, Method};
use crate::storage::{
    BlobBackend, DownloadContext, ExpiryClassifier, FileHeader, RequestRetrier, RetryKey,
    StageContext, StorageCredential, UploadContext,
};
use super::config::S3Location;

const MB: u64 = 1024 * 1024;
const CHUNK_SIZE: u64 = 8 * MB; // 8MB per chunk
const MIN_CHUNK_SIZE: u64 = 5 * MB; // S3最小5MB
const MAX_PARTS: u64 = 10_000;
const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * MB;
const PRESIGN_EXPIRY_SECS: u32 = 3600;

const META_DIGEST: &str = "x-amz-meta-sfc-digest";
const META_KEY: &str = "x-amz-meta-x-amz-key";
const META_IV: &str = "x-amz-meta-x-amz-iv";
const META_MATDESC: &str = "x-amz-meta-x-amz-matdesc";

#[derive(Debug, Deserialize)]
struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId")]
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct S3ErrorBody {
    #[serde(rename = "Code", default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct AccelerateConfiguration {
    #[serde(rename = "Status", default)]
    status: Option<String>,
}

/// Error code of an S3 XML error body / 解析S3错误码
fn error_code(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    quick_xml::de::from_str::<S3ErrorBody>(text).ok().map(|e| e.code)
}

/// Part size for an object of `size` bytes / 计算分片大小
pub fn part_size_for(size: u64) -> Result<u64> {
    if size > MAX_OBJECT_SIZE {
        return Err(anyhow!("File size {} exceeds the S3 object size limit of 5TB", size));
    }
    if size.div_ceil(CHUNK_SIZE) > MAX_PARTS {
        return Ok(size.div_ceil(MAX_PARTS).max(MIN_CHUNK_SIZE));
    }
    Ok(CHUNK_SIZE)
}

fn custom_queries(queries: Vec<(&str, String)>) -> Option<HashMap<String, String>> {
    if queries.is_empty() {
        return None;
    }
    Some(queries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|e| anyhow!("Invalid header name {}: {}", name, e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| anyhow!("Invalid value for header {}: {}", name, e))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// S3 backend / S3驱动
pub struct S3Backend {
    location: S3Location,
    credential: Arc<StorageCredential>,
    retrier: RequestRetrier,
    accelerate: AtomicBool,
    upload_id: Mutex<Option<String>>,
    etags: Mutex<BTreeMap<u64, String>>,
}

impl S3Backend {
    pub fn new(location: S3Location, ctx: &StageContext) -> Self {
        Self {
            location,
            credential: ctx.credential.clone(),
            retrier: RequestRetrier::new(ctx.transport.clone(), ctx.credential.clone(), ctx.retry_policy.clone()),
            accelerate: AtomicBool::new(false),
            upload_id: Mutex::new(None),
            etags: Mutex::new(BTreeMap::new()),
        }
    }

    /// Current access key, secret key and session token / 当前凭证
    fn keys(&self) -> Result<(String, String, Option<String>)> {
        let creds = self.credential.creds();
        let access_key_id = creds.get("AWS_KEY_ID").cloned()
            .ok_or_else(|| anyhow!("Missing AWS_KEY_ID in stage credentials"))?;
        let secret_access_key = creds.get("AWS_SECRET_KEY").cloned()
            .ok_or_else(|| anyhow!("Missing AWS_SECRET_KEY in stage credentials"))?;
        Ok((access_key_id, secret_access_key, creds.get("AWS_TOKEN").cloned()))
    }

    /// Bucket client for the current credentials / 按当前凭证创建Bucket
    fn create_bucket(&self, accelerate: bool) -> Result<Box<Bucket>> {
        let (access_key_id, secret_access_key, token) = self.keys()?;
        let credentials = Credentials::new(
            Some(access_key_id.as_str()),
            Some(secret_access_key.as_str()),
            token.as_deref(),
            None,
            None,
        ).map_err(|e| anyhow!("创建S3凭证失败 / invalid S3 credentials: {}", e))?;

        let bucket = Bucket::new(&self.location.bucket, self.region(accelerate), credentials)
            .map_err(|e| anyhow!("创建S3 Bucket失败 / invalid S3 bucket: {}", e))?;
        Ok(bucket)
    }

    fn region(&self, accelerate: bool) -> Region {
        Region::Custom {
            region: self.location.region.clone(),
            endpoint: format!("https://{}", self.location.endpoint(accelerate)),
        }
    }

    /// Presigned GET / 预签名GET请求
    async fn presigned_get(
        &self,
        key: &str,
        queries: Vec<(&str, String)>,
        headers: &[(String, String)],
        accelerate: bool,
    ) -> Result<HttpRequest> {
        let url = self.create_bucket(accelerate)?
            .presign_get(key, PRESIGN_EXPIRY_SECS, custom_queries(queries))
            .await
            .map_err(|e| anyhow!("生成预签名URL失败 / presign GET {}: {}", key, e))?;
        let mut request = HttpRequest::new(Method::GET, url);
        for (name, value) in headers {
            request.set_header(name.clone(), value.clone());
        }
        Ok(request)
    }

    /// Presigned PUT, signing `headers` along with the URL / 预签名PUT请求
    async fn presigned_put(
        &self,
        key: &str,
        queries: Vec<(&str, String)>,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<HttpRequest> {
        let custom_headers = if headers.is_empty() { None } else { Some(header_map(headers)?) };
        let url = self.create_bucket(self.accelerate.load(Ordering::SeqCst))?
            .presign_put(key, PRESIGN_EXPIRY_SECS, custom_headers, custom_queries(queries))
            .await
            .map_err(|e| anyhow!("生成预签名URL失败 / presign PUT {}: {}", key, e))?;
        let mut request = HttpRequest::new(Method::PUT, url).body(body);
        for (name, value) in headers {
            request.set_header(name.clone(), value.clone());
        }
        Ok(request)
    }

    /// Header-signed request for calls without a presigned form / 请求头签名
    fn signed(&self, method: Method, url: &str, headers: &[(String, String)], body: Bytes) -> Result<HttpRequest> {
        let (access_key_id, secret_access_key, token) = self.keys()?;
        let parsed = Url::parse(url).map_err(|e| anyhow!("Invalid S3 URL {}: {}", url, e))?;
        let host = parsed.host_str().ok_or_else(|| anyhow!("S3 URL has no host: {}", url))?;

        let now = Utc::now();
        let datetime = OffsetDateTime::from_unix_timestamp(now.timestamp())
            .map_err(|e| anyhow!("Invalid signing time: {}", e))?;
        let payload_hash = hex::encode(Sha256::digest(&body));

        let mut request = HttpRequest::new(method, url).body(body);
        for (name, value) in headers {
            request.set_header(name.clone(), value.clone());
        }
        request.set_header("host", host);
        request.set_header("x-amz-date", now.format("%Y%m%dT%H%M%SZ").to_string());
        request.set_header("x-amz-content-sha256", payload_hash.clone());
        if let Some(token) = token {
            request.set_header("x-amz-security-token", token);
        }

        let signed_headers = header_map(&request.headers)?;
        let region = self.region(false);
        let canonical = signing::canonical_request(request.method.as_str(), &parsed, &signed_headers, &payload_hash)
            .map_err(|e| anyhow!("S3 signing failed: {}", e))?;
        let string_to_sign = signing::string_to_sign(&datetime, &region, &canonical)
            .map_err(|e| anyhow!("S3 signing failed: {}", e))?;
        let signing_key = signing::signing_key(&datetime, &secret_access_key, &region, "s3")
            .map_err(|e| anyhow!("S3 signing failed: {}", e))?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&signing_key)
            .map_err(|e| anyhow!("S3 signing failed: {}", e))?;
        mac.update(string_to_sign.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        let authorization = signing::authorization_header(
            &access_key_id,
            &datetime,
            &region,
            &signing::signed_header_string(&signed_headers),
            &signature,
        ).map_err(|e| anyhow!("S3 signing failed: {}", e))?;
        request.set_header("authorization", authorization);
        Ok(request)
    }

    fn object_url(&self, name: &str) -> String {
        self.location.object_url(name, self.accelerate.load(Ordering::SeqCst))
    }

    fn metadata_headers(ctx: &UploadContext) -> Vec<(String, String)> {
        let mut headers = vec![
            ("content-type".to_string(), "application/octet-stream".to_string()),
            (META_DIGEST.to_string(), ctx.digest.clone()),
        ];
        if let Some(meta) = &ctx.encryption_metadata {
            headers.push((META_KEY.to_string(), meta.key.clone()));
            headers.push((META_IV.to_string(), meta.iv.clone()));
            headers.push((META_MATDESC.to_string(), meta.matdesc.clone()));
        }
        headers
    }

    fn upload_id(&self) -> Result<String> {
        self.upload_id.lock().clone()
            .ok_or_else(|| anyhow!("Multipart upload was not initiated"))
    }
}

#[async_trait]
impl ExpiryClassifier for S3Backend {
    fn has_expired_token(&self, response: &HttpResponse) -> bool {
        response.status == 400 && error_code(&response.body).as_deref() == Some("ExpiredToken")
    }
}

#[async_trait]
impl BlobBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn chunk_size(&self) -> u64 {
        CHUNK_SIZE
    }

    fn chunk_size_for(&self, file_size: u64) -> Result<u64> {
        part_size_for(file_size)
    }

    async fn get_file_header(&self, name: &str) -> Result<Option<FileHeader>> {
        let url = self.object_url(name);
        let resp = self.retrier
            .send(RetryKey::Head, self, || self.signed(Method::HEAD, &url, &[], Bytes::new()))
            .await?;
        if resp.status == 404 {
            return Ok(None);
        }
        let resp = resp.error_for_status(&format!("HEAD {}", self.location.key(name)))?;

        let encryption_metadata = match (resp.header(META_KEY), resp.header(META_IV)) {
            (Some(key), Some(iv)) => Some(EncryptionMetadata {
                key: key.to_string(),
                iv: iv.to_string(),
                matdesc: resp.header(META_MATDESC).unwrap_or_default().to_string(),
            }),
            _ => None,
        };
        Ok(Some(FileHeader {
            digest: resp.header(META_DIGEST).map(|d| d.to_string()),
            content_length: resp.header("content-length").and_then(|l| l.parse().ok()),
            encryption_metadata,
        }))
    }

    async fn transfer_accelerate_config(&self, use_accelerate: Option<bool>) -> Result<bool> {
        // These endpoints are fixed, skip the lookup
        if self.location.is_china_region()
            || self.location.end_point.is_some()
            || self.location.use_regional_url
        {
            self.accelerate.store(false, Ordering::SeqCst);
            return Ok(false);
        }
        if let Some(enabled) = use_accelerate {
            self.accelerate.store(enabled, Ordering::SeqCst);
            return Ok(enabled);
        }

        // Bucket level request, always against the global endpoint
        let resp = self.retrier
            .send_with(RetryKey::Accelerate, self, || {
                self.presigned_get("", vec![("accelerate", String::new())], &[], false)
            })
            .await?;
        let enabled = if resp.is_success() {
            quick_xml::de::from_str::<AccelerateConfiguration>(&resp.text())
                .ok()
                .and_then(|c| c.status)
                .map(|s| s == "Enabled")
                .unwrap_or(false)
        } else {
            tracing::debug!("Accelerate config not readable for {} (HTTP {})", self.location.bucket, resp.status);
            false
        };
        tracing::info!("S3 transfer acceleration for {}: {}", self.location.bucket, enabled);
        self.accelerate.store(enabled, Ordering::SeqCst);
        Ok(enabled)
    }

    async fn initiate_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        let url = format!("{}?uploads", self.object_url(&ctx.dst_file_name));
        let headers = Self::metadata_headers(ctx);
        let resp = self.retrier
            .send(RetryKey::Initiate, self, || self.signed(Method::POST, &url, &headers, Bytes::new()))
            .await?
            .error_for_status("Initiate multipart upload")?;

        let result: InitiateMultipartUploadResult = quick_xml::de::from_str(&resp.text())
            .map_err(|e| anyhow!("Failed to parse multipart upload response: {}", e))?;
        tracing::debug!("Multipart upload of {} started: {}", ctx.dst_file_name, result.upload_id);
        *self.upload_id.lock() = Some(result.upload_id);
        self.etags.lock().clear();
        Ok(())
    }

    async fn upload_chunk(&self, ctx: &UploadContext, chunk_id: u64, data: Bytes) -> Result<()> {
        let key = self.location.key(&ctx.dst_file_name);
        if !ctx.is_multipart() {
            let headers = Self::metadata_headers(ctx);
            self.retrier
                .send_with(RetryKey::Chunk(chunk_id), self, || {
                    self.presigned_put(&key, Vec::new(), &headers, data.clone())
                })
                .await?
                .error_for_status(&format!("PUT {}", ctx.dst_file_name))?;
            return Ok(());
        }

        let upload_id = self.upload_id()?;
        let resp = self.retrier
            .send_with(RetryKey::Chunk(chunk_id), self, || {
                let queries = vec![
                    ("partNumber", (chunk_id + 1).to_string()),
                    ("uploadId", upload_id.clone()),
                ];
                self.presigned_put(&key, queries, &[], data.clone())
            })
            .await?
            .error_for_status(&format!("Upload part {}", chunk_id + 1))?;
        let etag = resp.header("etag")
            .ok_or_else(|| anyhow!("Part {} response has no ETag", chunk_id + 1))?
            .to_string();
        self.etags.lock().insert(chunk_id, etag);
        Ok(())
    }

    async fn complete_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        let upload_id = self.upload_id()?;
        let body = {
            let etags = self.etags.lock();
            if etags.len() as u64 != ctx.num_chunks {
                return Err(anyhow!("Only {} of {} parts were uploaded", etags.len(), ctx.num_chunks));
            }
            let parts: String = etags.iter()
                .map(|(chunk_id, etag)| format!("<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>", chunk_id + 1, etag))
                .collect();
            Bytes::from(format!("<CompleteMultipartUpload>{}</CompleteMultipartUpload>", parts))
        };
        let url = format!("{}?uploadId={}", self.object_url(&ctx.dst_file_name), urlencoding::encode(&upload_id));
        let headers = vec![("content-type".to_string(), "application/xml".to_string())];
        let resp = self.retrier
            .send(RetryKey::Complete, self, || self.signed(Method::POST, &url, &headers, body.clone()))
            .await?
            .error_for_status("Complete multipart upload")?;

        // A 200 response may still carry an error document
        if let Some(code) = error_code(&resp.body).filter(|c| !c.is_empty()) {
            return Err(anyhow!("Complete multipart upload failed: {}", code));
        }
        tracing::debug!("Multipart upload of {} completed", ctx.dst_file_name);
        Ok(())
    }

    async fn abort_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        let Some(upload_id) = self.upload_id.lock().clone() else {
            return Ok(());
        };
        let url = format!("{}?uploadId={}", self.object_url(&ctx.dst_file_name), urlencoding::encode(&upload_id));
        let resp = self.retrier
            .send(RetryKey::Abort, self, || self.signed(Method::DELETE, &url, &[], Bytes::new()))
            .await?;
        if resp.status != 404 {
            resp.error_for_status("Abort multipart upload")?;
        }
        tracing::debug!("Multipart upload of {} aborted", ctx.dst_file_name);
        Ok(())
    }

    async fn download_chunk(
        &self,
        ctx: &DownloadContext,
        chunk_id: u64,
        range: Option<Range<u64>>,
    ) -> Result<Bytes> {
        let key = self.location.key(&ctx.src_file_name);
        let accelerate = self.accelerate.load(Ordering::SeqCst);
        let headers: Vec<(String, String)> = range.as_ref()
            .map(|r| vec![("range".to_string(), format!("bytes={}-{}", r.start, r.end.saturating_sub(1)))])
            .unwrap_or_default();
        let resp = self.retrier
            .send_with(RetryKey::Chunk(chunk_id), self, || {
                self.presigned_get(&key, Vec::new(), &headers, accelerate)
            })
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
    use std::sync::atomic::AtomicUsize;

    use crate::storage::credential::CredentialRefresher;
    use crate::storage::retry::tests::ScriptedTransport;
    use crate::storage::{RetryPolicy, StageInfo};
    use crate::transfer::CommandType;

    struct CountingRefresher(AtomicUsize);

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<HashMap<String, String>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(creds("NEW"))
        }
    }

    fn creds(key_id: &str) -> HashMap<String, String> {
        HashMap::from([
            ("AWS_KEY_ID".to_string(), key_id.to_string()),
            ("AWS_SECRET_KEY".to_string(), "secret".to_string()),
        ])
    }

    fn backend(transport: Arc<ScriptedTransport>, refresher: Option<Arc<dyn CredentialRefresher>>) -> S3Backend {
        backend_with(transport, refresher, false)
    }

    fn backend_with(
        transport: Arc<ScriptedTransport>,
        refresher: Option<Arc<dyn CredentialRefresher>>,
        use_s3_regional_url: bool,
    ) -> S3Backend {
        let ctx = StageContext {
            stage_info: Arc::new(StageInfo {
                location_type: "S3".to_string(),
                location: "bucket/stage".to_string(),
                region: Some("us-west-2".to_string()),
                ..StageInfo::default()
            }),
            credential: Arc::new(StorageCredential::new(creds("OLD"), refresher)),
            transport,
            retry_policy: RetryPolicy::default(),
            command_type: CommandType::Upload,
            use_s3_regional_url,
            presigned_url: None,
            dst_file_name: "a.csv.gz".to_string(),
            command: "PUT".to_string(),
            executor: None,
        };
        S3Backend::new(S3Location::from_context(&ctx).unwrap(), &ctx)
    }

    fn upload_ctx(num_chunks: u64) -> UploadContext {
        UploadContext {
            dst_file_name: "a.csv.gz".to_string(),
            digest: "abc=".to_string(),
            upload_size: 100,
            num_chunks,
            encryption_metadata: Some(EncryptionMetadata {
                key: "k".to_string(),
                iv: "iv".to_string(),
                matdesc: "{}".to_string(),
            }),
            dst_compression_type: None,
        }
    }

    fn query(url: &str, name: &str) -> Option<String> {
        Url::parse(url).unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    fn host(url: &str) -> String {
        Url::parse(url).unwrap().host_str().unwrap().to_string()
    }

    #[test]
    fn test_part_size() {
        assert_eq!(part_size_for(200 * MB).unwrap(), 8 * MB);
        let big = 100 * 1024 * MB;
        assert_eq!(part_size_for(big).unwrap(), big.div_ceil(MAX_PARTS));
        assert!(part_size_for(big).unwrap() * MAX_PARTS >= big);
        assert!(part_size_for(MAX_OBJECT_SIZE + 1).is_err());
    }

    #[tokio::test]
    async fn test_head_reads_metadata() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(200)
            .with_header(META_DIGEST, "d1")
            .with_header(META_KEY, "k")
            .with_header(META_IV, "iv")
            .with_header("Content-Length", "42"))]);
        let backend = backend(transport.clone(), None);

        let header = backend.get_file_header("a.csv.gz").await.unwrap().unwrap();
        assert_eq!(header.digest.as_deref(), Some("d1"));
        assert_eq!(header.content_length, Some(42));
        assert_eq!(header.encryption_metadata.unwrap().matdesc, "");

        let request = &transport.requests.lock()[0];
        assert_eq!(request.method, Method::HEAD);
        assert_eq!(request.url, "https://bucket.s3.amazonaws.com/stage/a.csv.gz");
        assert!(request.get_header("authorization").unwrap().contains("Credential=OLD/"));
    }

    #[tokio::test]
    async fn test_head_not_found() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(404))]);
        assert!(backend(transport, None).get_file_header("a.csv.gz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_and_resigns() {
        let expired = HttpResponse::new(400)
            .with_body("<Error><Code>ExpiredToken</Code><Message>expired</Message></Error>");
        let transport = ScriptedTransport::new(vec![Ok(expired), Ok(HttpResponse::new(404))]);
        let refresher = Arc::new(CountingRefresher(AtomicUsize::new(0)));
        let backend = backend(transport.clone(), Some(refresher.clone()));

        assert!(backend.get_file_header("a.csv.gz").await.unwrap().is_none());
        assert_eq!(refresher.0.load(Ordering::SeqCst), 1);
        let requests = transport.requests.lock();
        assert!(requests[1].get_header("authorization").unwrap().contains("Credential=NEW/"));
    }

    #[test]
    fn test_other_400_is_not_expiry() {
        let backend = backend(ScriptedTransport::new(vec![]), None);
        let bad = HttpResponse::new(400).with_body("<Error><Code>InvalidArgument</Code></Error>");
        assert!(!backend.has_expired_token(&bad));
    }

    #[tokio::test]
    async fn test_multipart_flow() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(200).with_body(
                "<InitiateMultipartUploadResult><Bucket>bucket</Bucket><Key>k</Key><UploadId>up-1</UploadId></InitiateMultipartUploadResult>",
            )),
            Ok(HttpResponse::new(200).with_header("ETag", "\"e2\"")),
            Ok(HttpResponse::new(200).with_header("ETag", "\"e1\"")),
            Ok(HttpResponse::new(200).with_body("<CompleteMultipartUploadResult></CompleteMultipartUploadResult>")),
        ]);
        let backend = backend(transport.clone(), None);
        let ctx = upload_ctx(2);

        backend.initiate_multipart_upload(&ctx).await.unwrap();
        backend.upload_chunk(&ctx, 1, Bytes::from_static(b"tail")).await.unwrap();
        backend.upload_chunk(&ctx, 0, Bytes::from_static(b"head")).await.unwrap();
        backend.complete_multipart_upload(&ctx).await.unwrap();

        let requests = transport.requests.lock();
        assert_eq!(requests[0].method, Method::POST);
        assert!(requests[0].url.ends_with("/stage/a.csv.gz?uploads"));
        assert_eq!(requests[0].get_header(META_DIGEST), Some("abc="));
        assert_eq!(requests[0].get_header(META_IV), Some("iv"));
        assert_eq!(requests[1].method, Method::PUT);
        assert_eq!(Url::parse(&requests[1].url).unwrap().path(), "/stage/a.csv.gz");
        assert_eq!(query(&requests[1].url, "partNumber").as_deref(), Some("2"));
        assert_eq!(query(&requests[1].url, "uploadId").as_deref(), Some("up-1"));
        assert!(query(&requests[1].url, "X-Amz-Signature").is_some());
        let body = String::from_utf8(requests[3].body.to_vec()).unwrap();
        assert_eq!(
            body,
            "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"e2\"</ETag></Part></CompleteMultipartUpload>"
        );
    }

    #[tokio::test]
    async fn test_complete_with_missing_part_fails() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(200).with_body("<InitiateMultipartUploadResult><UploadId>up-1</UploadId></InitiateMultipartUploadResult>")),
            Ok(HttpResponse::new(204)),
        ]);
        let backend = backend(transport.clone(), None);
        let ctx = upload_ctx(2);
        backend.initiate_multipart_upload(&ctx).await.unwrap();
        assert!(backend.complete_multipart_upload(&ctx).await.is_err());
        backend.abort_multipart_upload(&ctx).await.unwrap();
        assert_eq!(transport.requests.lock()[1].method, Method::DELETE);
    }

    #[tokio::test]
    async fn test_accelerate_config_lookup() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(200).with_body("<AccelerateConfiguration><Status>Enabled</Status></AccelerateConfiguration>")),
            Ok(HttpResponse::new(404)),
        ]);
        let backend = backend(transport.clone(), None);
        assert!(backend.transfer_accelerate_config(None).await.unwrap());
        backend.get_file_header("a.csv.gz").await.unwrap();

        let requests = transport.requests.lock();
        assert_eq!(host(&requests[0].url), "bucket.s3.amazonaws.com");
        assert_eq!(Url::parse(&requests[0].url).unwrap().path(), "/");
        assert!(query(&requests[0].url, "accelerate").is_some());
        assert_eq!(requests[1].url, "https://bucket.s3-accelerate.amazonaws.com/stage/a.csv.gz");
    }

    #[tokio::test]
    async fn test_regional_url_never_accelerates() {
        let transport = ScriptedTransport::new(vec![
            Ok(HttpResponse::new(200).with_body("<AccelerateConfiguration><Status>Enabled</Status></AccelerateConfiguration>")),
        ]);
        let backend = backend_with(transport.clone(), None, true);
        assert!(!backend.transfer_accelerate_config(None).await.unwrap());
        assert!(!backend.transfer_accelerate_config(Some(true)).await.unwrap());
        assert_eq!(transport.request_count(), 0);

        backend.get_file_header("a.csv.gz").await.unwrap();
        assert_eq!(transport.requests.lock()[0].url, "https://bucket.s3.us-west-2.amazonaws.com/stage/a.csv.gz");
    }

    #[tokio::test]
    async fn test_single_put_is_presigned_with_metadata() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(200))]);
        let backend = backend(transport.clone(), None);
        backend.upload_chunk(&upload_ctx(1), 0, Bytes::from_static(b"data")).await.unwrap();

        let requests = transport.requests.lock();
        let request = &requests[0];
        assert_eq!(request.method, Method::PUT);
        assert_eq!(host(&request.url), "bucket.s3.amazonaws.com");
        assert_eq!(Url::parse(&request.url).unwrap().path(), "/stage/a.csv.gz");
        assert!(query(&request.url, "X-Amz-Credential").unwrap().starts_with("OLD/"));
        assert!(query(&request.url, "X-Amz-Signature").is_some());
        assert_eq!(request.get_header(META_DIGEST), Some("abc="));
        assert_eq!(request.get_header(META_MATDESC), Some("{}"));
        assert_eq!(request.body.as_ref(), b"data");
    }

    #[tokio::test]
    async fn test_expired_token_presigns_again_with_new_credentials() {
        let expired = HttpResponse::new(400)
            .with_body("<Error><Code>ExpiredToken</Code><Message>expired</Message></Error>");
        let transport = ScriptedTransport::new(vec![Ok(expired), Ok(HttpResponse::new(200))]);
        let refresher = Arc::new(CountingRefresher(AtomicUsize::new(0)));
        let backend = backend(transport.clone(), Some(refresher.clone()));

        backend.upload_chunk(&upload_ctx(1), 0, Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(refresher.0.load(Ordering::SeqCst), 1);
        let requests = transport.requests.lock();
        assert!(query(&requests[0].url, "X-Amz-Credential").unwrap().starts_with("OLD/"));
        assert!(query(&requests[1].url, "X-Amz-Credential").unwrap().starts_with("NEW/"));
    }

    #[tokio::test]
    async fn test_ranged_download() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse::new(206).with_body("0123456789"))]);
        let backend = backend(transport.clone(), None);
        let ctx = DownloadContext { src_file_name: "a.csv.gz".to_string(), file_size: 100 };
        let data = backend.download_chunk(&ctx, 1, Some(10..20)).await.unwrap();
        assert_eq!(data.as_ref(), b"0123456789");
        let requests = transport.requests.lock();
        assert_eq!(requests[0].method, Method::GET);
        assert_eq!(requests[0].get_header("range"), Some("bytes=10-19"));
        assert_eq!(host(&requests[0].url), "bucket.s3.amazonaws.com");
        assert!(query(&requests[0].url, "X-Amz-Signature").is_some());
    }
}
