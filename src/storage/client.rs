//! Per-file storage client / 单文件存储客户端
//!
//! Wraps one [`BlobBackend`] together with the state of the file it moves:
//! the chunk plan, the temp directory used for compression and encryption,
//! the chunk tally, and the final settle/cleanup logic.

use std::io::Cursor;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{BlobBackend, DownloadContext, FileHeader, ProgressCallback, UploadContext};
use crate::encryption::{self, EncryptionMaterial, EncryptionMetadata};
use crate::file_util;
use crate::transfer::meta::{CommandType, ResultStatus, TransferMeta};
use crate::transfer::tracker::ChunkTally;
use crate::utils::base_name;

/// Number of chunks for a file / 计算分片数量
///
/// Files below the threshold, and every file of a non-chunked backend, go
/// in a single request. An empty file is still one chunk.
pub fn plan_chunks(size: u64, threshold: u64, chunk_size: u64, chunked: bool) -> u64 {
    if !chunked || size < threshold || size == 0 {
        return 1;
    }
    size.div_ceil(chunk_size.max(1)).max(1)
}

/// Byte range of chunk `chunk_id` / 分片的字节范围
///
/// The last chunk always extends to the end of the file.
pub fn chunk_range(chunk_id: u64, num_chunks: u64, chunk_size: u64, size: u64) -> Range<u64> {
    if num_chunks <= 1 {
        return 0..size;
    }
    let start = (chunk_id * chunk_size).min(size);
    let end = if chunk_id + 1 >= num_chunks {
        size
    } else {
        ((chunk_id + 1) * chunk_size).min(size)
    };
    start..end
}

#[derive(Debug, Clone)]
enum UploadSource {
    File(PathBuf),
    Memory(Bytes),
}

#[derive(Debug, Clone)]
struct UploadState {
    ctx: UploadContext,
    source: UploadSource,
    chunk_size: u64,
    multipart_initiated: bool,
}

#[derive(Debug, Clone)]
struct DownloadState {
    ctx: DownloadContext,
    part_path: PathBuf,
    final_path: PathBuf,
    chunk_size: u64,
    header: Option<FileHeader>,
}

/// Client options shared by every file of an invocation / 客户端选项
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub skip_upload_on_content_match: bool,
    /// Root for per-file temp directories, system temp when `None`
    pub tmp_root: Option<PathBuf>,
    pub progress: Option<ProgressCallback>,
}

pub struct StorageClient {
    backend: Box<dyn BlobBackend>,
    meta: Mutex<TransferMeta>,
    command_type: CommandType,
    options: ClientOptions,
    tmp_dir: Mutex<Option<TempDir>>,
    upload: Mutex<Option<UploadState>>,
    download: Mutex<Option<DownloadState>>,
    tally: ChunkTally,
    preprocessed: AtomicBool,
    first_error: Mutex<Option<String>>,
    transferred: AtomicU64,
}

impl StorageClient {
    pub fn new(
        backend: Box<dyn BlobBackend>,
        meta: TransferMeta,
        command_type: CommandType,
        options: ClientOptions,
    ) -> Self {
        Self {
            backend,
            meta: Mutex::new(meta),
            command_type,
            options,
            tmp_dir: Mutex::new(None),
            upload: Mutex::new(None),
            download: Mutex::new(None),
            tally: ChunkTally::new(),
            preprocessed: AtomicBool::new(false),
            first_error: Mutex::new(None),
            transferred: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &dyn BlobBackend {
        self.backend.as_ref()
    }

    pub fn name(&self) -> String {
        self.meta.lock().name.clone()
    }

    /// Snapshot of the transfer record / 传输记录快照
    pub fn meta(&self) -> TransferMeta {
        self.meta.lock().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.meta.lock().is_settled()
    }

    pub fn tally(&self) -> &ChunkTally {
        &self.tally
    }

    pub fn num_chunks(&self) -> u64 {
        self.tally.total()
    }

    fn failed_dst_size(&self) -> i64 {
        match self.command_type {
            CommandType::Upload => 0,
            CommandType::Download => -1,
        }
    }

    /// Settle the file as ERROR / 标记文件失败
    pub fn fail(&self, message: impl Into<String>) {
        let dst_size = self.failed_dst_size();
        let mut meta = self.meta.lock();
        if meta.fail(message) {
            meta.dst_file_size = dst_size;
        }
    }

    /// Remember the first error seen for this file / 记录首个错误
    pub fn note_error(&self, message: impl Into<String>) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(message.into());
        }
    }

    fn first_error(&self) -> Option<String> {
        self.first_error.lock().clone()
    }

    /// Record the outcome of one chunk / 记录分片结果
    ///
    /// Returns `true` when this was the last outstanding chunk.
    pub fn record_chunk(&self, chunk_id: u64, outcome: &Result<()>) -> bool {
        if let Err(e) = outcome {
            tracing::warn!("{}: chunk {} failed: {}", self.name(), chunk_id, e);
            self.note_error(e.to_string());
        }
        self.tally.record(outcome.is_ok())
    }

    fn report_progress(&self, bytes: u64, total: u64) {
        let done = self.transferred.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if let Some(progress) = &self.options.progress {
            progress(&self.name(), done, total.max(done));
        }
    }

    fn ensure_tmp_dir(&self) -> Result<PathBuf> {
        let mut guard = self.tmp_dir.lock();
        if let Some(dir) = guard.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let mut builder = tempfile::Builder::new();
        builder.prefix("stage-transfer-");
        let dir = match &self.options.tmp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| anyhow!("Failed to create temp directory: {}", e))?;
        let path = dir.path().to_path_buf();
        tracing::debug!("Created temp directory {}", path.display());
        *guard = Some(dir);
        Ok(path)
    }

    // ---------- upload ----------

    /// Probe, compress, digest, encrypt and plan an upload / 上传预处理
    ///
    /// Leaves the record settled as SKIPPED when nothing has to be sent.
    pub async fn prepare_upload(&self) -> Result<()> {
        if self.preprocessed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (name, src_file_name, dst_file_name, overwrite, require_compress, src_stream, material) = {
            let meta = self.meta.lock();
            (
                meta.name.clone(),
                meta.src_file_name.clone(),
                meta.dst_file_name.clone(),
                meta.overwrite,
                meta.require_compress,
                meta.src_stream.clone(),
                meta.encryption_material.clone(),
            )
        };
        tracing::debug!("Preprocessing {}", src_file_name);

        let header = if self.backend.supports_head() {
            let header = self.backend.get_file_header(&dst_file_name).await?;
            self.meta.lock().remote_status = Some(if header.is_some() {
                ResultStatus::Uploaded
            } else {
                ResultStatus::NotFoundFile
            });
            header
        } else {
            None
        };

        if !overwrite && header.is_some() {
            tracing::debug!("{} already exists in the stage, skipping", dst_file_name);
            let mut meta = self.meta.lock();
            meta.dst_file_size = 0;
            meta.settle(ResultStatus::Skipped);
            return Ok(());
        }

        let tmp_dir = if require_compress || material.is_some() {
            Some(self.ensure_tmp_dir()?)
        } else {
            None
        };

        let (source, digest, size) = {
            let src = PathBuf::from(&src_file_name);
            let tmp_dir = tmp_dir.clone();
            tokio::task::spawn_blocking(move || compress_and_digest(&src, src_stream, require_compress, tmp_dir.as_deref()))
                .await
                .map_err(|e| anyhow!("Preprocess task failed: {}", e))??
        };

        {
            let mut meta = self.meta.lock();
            meta.sha256_digest = Some(digest.clone());
            meta.upload_size = size;
            match &source {
                UploadSource::File(path) => meta.real_src_file_name = Some(path.clone()),
                UploadSource::Memory(data) if require_compress => meta.intermediate_stream = Some(data.clone()),
                UploadSource::Memory(_) => {}
            }
        }

        if self.options.skip_upload_on_content_match {
            if let Some(remote_digest) = header.as_ref().and_then(|h| h.digest.as_deref()) {
                if remote_digest == digest {
                    tracing::debug!("Same file contents for {}, skipping upload", name);
                    self.meta.lock().settle(ResultStatus::Skipped);
                    return Ok(());
                }
            }
        }

        let (source, encryption_metadata) = match (&material, tmp_dir) {
            (Some(material), Some(tmp_dir)) => {
                let material = material.clone();
                tokio::task::spawn_blocking(move || encrypt_source(&material, source, &tmp_dir))
                    .await
                    .map_err(|e| anyhow!("Encryption task failed: {}", e))??
            }
            _ => (source, None),
        };
        let upload_size = match &source {
            UploadSource::File(path) => tokio::fs::metadata(path).await
                .map_err(|e| anyhow!("Failed to stat {}: {}", path.display(), e))?
                .len(),
            UploadSource::Memory(data) => data.len() as u64,
        };

        let (threshold, dst_compression_type) = {
            let mut meta = self.meta.lock();
            meta.upload_size = upload_size;
            (meta.multipart_threshold, meta.dst_compression_type)
        };

        let chunked = self.backend.chunked_transfer();
        let chunk_size = self.backend.chunk_size_for(upload_size)?;
        let num_chunks = plan_chunks(upload_size, threshold, chunk_size, chunked);
        tracing::debug!("{}: {} bytes in {} chunk(s)", name, upload_size, num_chunks);

        let ctx = UploadContext {
            dst_file_name,
            digest,
            upload_size,
            num_chunks,
            encryption_metadata,
            dst_compression_type,
        };
        *self.upload.lock() = Some(UploadState {
            ctx: ctx.clone(),
            source,
            chunk_size,
            multipart_initiated: false,
        });
        self.tally.set_total(num_chunks);

        if chunked && num_chunks > 1 {
            self.backend.initiate_multipart_upload(&ctx).await?;
            if let Some(state) = self.upload.lock().as_mut() {
                state.multipart_initiated = true;
            }
        }
        Ok(())
    }

    /// Upload one chunk / 上传单个分片
    pub async fn upload_chunk(&self, chunk_id: u64) -> Result<()> {
        let state = self.upload.lock().clone()
            .ok_or_else(|| anyhow!("Upload of {} was not prepared", self.name()))?;
        let range = chunk_range(chunk_id, state.ctx.num_chunks, state.chunk_size, state.ctx.upload_size);

        let data = match &state.source {
            UploadSource::Memory(data) => data.slice(range.start as usize..range.end as usize),
            UploadSource::File(path) => read_range(path, range.clone()).await?,
        };
        let len = data.len() as u64;

        tracing::debug!("Uploading chunk {} of {}", chunk_id, state.ctx.dst_file_name);
        self.backend.upload_chunk(&state.ctx, chunk_id, data).await?;
        self.report_progress(len, state.ctx.upload_size);
        Ok(())
    }

    /// Complete or abort the upload and settle the record / 完成上传
    ///
    /// An `Err` means the multipart upload could not be completed or
    /// aborted; the record is already settled as ERROR in that case.
    pub async fn finish_upload(&self) -> Result<()> {
        let state = self.upload.lock().clone();

        if self.tally.is_complete_success() {
            let state = match state {
                Some(state) => state,
                None => {
                    self.fail("Upload finished without a plan");
                    return Ok(());
                }
            };
            if state.ctx.is_multipart() {
                if let Err(e) = self.backend.complete_multipart_upload(&state.ctx).await {
                    let message = format!("Failed to complete multipart upload of {}: {}", state.ctx.dst_file_name, e);
                    self.fail(message.clone());
                    return Err(anyhow!(message));
                }
            }
            let mut meta = self.meta.lock();
            meta.dst_file_size = state.ctx.upload_size as i64;
            meta.settle(ResultStatus::Uploaded);
            tracing::debug!("{} upload is completed", meta.src_file_name);
            return Ok(());
        }

        let reason = self.first_error()
            .unwrap_or_else(|| "Upload did not complete".to_string());
        let mut result = Ok(());
        if let Some(state) = state.filter(|s| s.multipart_initiated) {
            if let Err(e) = self.backend.abort_multipart_upload(&state.ctx).await {
                result = Err(anyhow!("Failed to abort multipart upload of {}: {}", state.ctx.dst_file_name, e));
            }
        }
        tracing::debug!("{} upload is aborted: {}", self.name(), reason);
        self.fail(reason);
        result
    }

    // ---------- download ----------

    /// Probe the source and preallocate `<dst>.part` / 下载预处理
    pub async fn prepare_download(&self) -> Result<()> {
        if self.preprocessed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (src_file_name, dst_file_name, local_location, threshold) = {
            let meta = self.meta.lock();
            (
                meta.src_file_name.clone(),
                meta.dst_file_name.clone(),
                meta.local_location.clone(),
                meta.multipart_threshold,
            )
        };
        let local_location = local_location
            .ok_or_else(|| anyhow!("No local directory given for {}", src_file_name))?;
        tokio::fs::create_dir_all(&local_location).await
            .map_err(|e| anyhow!("Failed to create {}: {}", local_location.display(), e))?;

        let header = if self.backend.supports_head() {
            match self.backend.get_file_header(&src_file_name).await? {
                Some(header) => {
                    self.meta.lock().remote_status = Some(ResultStatus::Uploaded);
                    Some(header)
                }
                None => {
                    tracing::warn!("{} not found in the stage", src_file_name);
                    let mut meta = self.meta.lock();
                    meta.remote_status = Some(ResultStatus::NotFoundFile);
                    meta.dst_file_size = -1;
                    meta.settle(ResultStatus::NotFoundFile);
                    return Ok(());
                }
            }
        } else {
            None
        };

        let file_size = header.as_ref().and_then(|h| h.content_length).unwrap_or(0);
        let chunk_size = self.backend.chunk_size();
        let num_chunks = if self.backend.chunked_transfer() && file_size > threshold {
            file_size.div_ceil(chunk_size.max(1))
        } else {
            1
        };
        self.meta.lock().src_file_size = file_size;

        let final_path = local_location.join(base_name(&dst_file_name));
        let part_path = part_path_for(&final_path);
        let part = tokio::fs::File::create(&part_path).await
            .map_err(|e| anyhow!("Failed to create {}: {}", part_path.display(), e))?;
        part.set_len(file_size).await?;
        drop(part);

        tracing::debug!("{}: {} bytes in {} chunk(s)", src_file_name, file_size, num_chunks);
        *self.download.lock() = Some(DownloadState {
            ctx: DownloadContext { src_file_name, file_size },
            part_path,
            final_path,
            chunk_size,
            header,
        });
        self.tally.set_total(num_chunks);
        Ok(())
    }

    /// Download one chunk into the `.part` file / 下载单个分片
    pub async fn download_chunk(&self, chunk_id: u64) -> Result<()> {
        let state = self.download.lock().clone()
            .ok_or_else(|| anyhow!("Download of {} was not prepared", self.name()))?;
        let num_chunks = self.tally.total();
        let range = (num_chunks > 1)
            .then(|| chunk_range(chunk_id, num_chunks, state.chunk_size, state.ctx.file_size));

        let data = self.backend.download_chunk(&state.ctx, chunk_id, range).await?;
        let offset = chunk_id * state.chunk_size;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&state.part_path)
            .await
            .map_err(|e| anyhow!("Failed to open {}: {}", state.part_path.display(), e))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        file.flush().await?;

        self.report_progress(data.len() as u64, state.ctx.file_size);
        Ok(())
    }

    /// Move the downloaded file into place and settle the record / 完成下载
    pub async fn finish_download(&self) {
        let state = self.download.lock().clone();

        if !self.tally.is_complete_success() {
            let reason = self.first_error()
                .unwrap_or_else(|| "Download did not complete".to_string());
            if let Some(state) = &state {
                remove_quietly(&state.part_path).await;
            }
            tracing::error!("Failed to download {}: {}", self.name(), reason);
            self.fail(reason);
            return;
        }

        let Some(state) = state else {
            self.fail("Download finished without a plan");
            return;
        };

        match self.finalize_download(&state).await {
            Ok(size) => {
                let mut meta = self.meta.lock();
                meta.dst_file_size = size as i64;
                if meta.src_file_size == 0 {
                    meta.src_file_size = size;
                }
                meta.settle(ResultStatus::Downloaded);
                tracing::debug!("{} download is completed", state.final_path.display());
            }
            Err(e) => {
                remove_quietly(&state.part_path).await;
                tracing::error!("Failed to finish download of {}: {}", state.final_path.display(), e);
                self.fail(e.to_string());
            }
        }
    }

    async fn finalize_download(&self, state: &DownloadState) -> Result<u64> {
        let material = self.meta.lock().encryption_material.clone();

        match material {
            Some(material) => {
                let metadata = self.download_encryption_metadata(state).await?;
                let part_path = state.part_path.clone();
                let final_path = state.final_path.clone();
                tokio::task::spawn_blocking(move || decrypt_into_place(&metadata, &material, &part_path, &final_path))
                    .await
                    .map_err(|e| anyhow!("Decryption task failed: {}", e))??;
                remove_quietly(&state.part_path).await;
            }
            None => {
                tokio::fs::rename(&state.part_path, &state.final_path).await
                    .map_err(|e| anyhow!("Failed to move {} into place: {}", state.final_path.display(), e))?;
            }
        }

        let size = tokio::fs::metadata(&state.final_path).await?.len();
        Ok(size)
    }

    /// Encryption metadata from the probe, or from the backend's cache when
    /// the probe could not run before the download.
    async fn download_encryption_metadata(&self, state: &DownloadState) -> Result<EncryptionMetadata> {
        let from_probe = state.header.as_ref().and_then(|h| h.encryption_metadata.clone());
        if let Some(metadata) = from_probe {
            return Ok(metadata);
        }
        self.backend.get_file_header(&state.ctx.src_file_name).await?
            .and_then(|h| h.encryption_metadata)
            .ok_or_else(|| anyhow!("No encryption metadata found for {}", state.ctx.src_file_name))
    }

    /// Release temp files and in-memory streams; safe to call twice / 清理客户端数据
    pub fn delete_client_data(&self) {
        if let Some(dir) = self.tmp_dir.lock().take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::debug!("Failed to delete {}: {}", path.display(), e);
            } else {
                tracing::debug!("Cleaned up temp directory {}", path.display());
            }
        }
        self.upload.lock().take();
        let mut meta = self.meta.lock();
        meta.src_stream = None;
        meta.intermediate_stream = None;
    }
}

fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

async fn read_range(path: &Path, range: Range<u64>) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await
        .map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buf).await
        .map_err(|e| anyhow!("Failed to read {} at {}: {}", path.display(), range.start, e))?;
    Ok(Bytes::from(buf))
}

fn compress_and_digest(
    src: &Path,
    src_stream: Option<Bytes>,
    require_compress: bool,
    tmp_dir: Option<&Path>,
) -> Result<(UploadSource, String, u64)> {
    match (src_stream, require_compress) {
        (Some(stream), true) => {
            let gz = file_util::compress_stream_with_gzip(&mut Cursor::new(stream.as_ref()))?;
            let (digest, size) = file_util::digest_and_size_for_bytes(&gz)?;
            Ok((UploadSource::Memory(gz), digest, size))
        }
        (Some(stream), false) => {
            let (digest, size) = file_util::digest_and_size_for_bytes(&stream)?;
            Ok((UploadSource::Memory(stream), digest, size))
        }
        (None, true) => {
            let tmp_dir = tmp_dir.ok_or_else(|| anyhow!("No temp directory for compression"))?;
            let (gz, _) = file_util::compress_file_with_gzip(src, tmp_dir)?;
            let (digest, size) = file_util::digest_and_size_for_file(&gz)?;
            Ok((UploadSource::File(gz), digest, size))
        }
        (None, false) => {
            let (digest, size) = file_util::digest_and_size_for_file(src)?;
            Ok((UploadSource::File(src.to_path_buf()), digest, size))
        }
    }
}

fn encrypt_source(
    material: &EncryptionMaterial,
    source: UploadSource,
    tmp_dir: &Path,
) -> Result<(UploadSource, Option<EncryptionMetadata>)> {
    match source {
        UploadSource::File(path) => {
            let (metadata, encrypted) = encryption::encrypt_file(material, &path, tmp_dir)?;
            Ok((UploadSource::File(encrypted), Some(metadata)))
        }
        UploadSource::Memory(data) => {
            let mut out = Vec::with_capacity(data.len() + 16);
            let metadata = encryption::encrypt_stream(material, &mut Cursor::new(data.as_ref()), &mut out)?;
            Ok((UploadSource::Memory(Bytes::from(out)), Some(metadata)))
        }
    }
}

fn decrypt_into_place(
    metadata: &EncryptionMetadata,
    material: &EncryptionMaterial,
    part_path: &Path,
    final_path: &Path,
) -> Result<()> {
    let dst_dir = final_path.parent()
        .ok_or_else(|| anyhow!("Invalid destination: {}", final_path.display()))?;
    let tmp = encryption::decrypt_file(metadata, material, part_path, dst_dir)?;
    tmp.persist(final_path)
        .map_err(|e| anyhow!("Failed to move {} into place: {}", final_path.display(), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::storage::http::HttpResponse;
    use crate::storage::retry::ExpiryClassifier;
    use crate::storage::StageLocationType;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_chunks() {
        assert_eq!(plan_chunks(4 * MB, 64 * MB, 8 * MB, true), 1);
        assert_eq!(plan_chunks(200 * MB, 64 * MB, 8 * MB, true), 25);
        assert_eq!(plan_chunks(200 * MB, 64 * MB, 8 * MB, false), 1);
        assert_eq!(plan_chunks(0, 0, 8 * MB, true), 1);
        assert_eq!(plan_chunks(64 * MB + 1, 64 * MB, 8 * MB, true), 9);
    }

    #[test]
    fn test_chunk_ranges_cover_file() {
        for (size, chunk) in [(100u64, 10u64), (101, 10), (7, 3), (25 * MB, 8 * MB)] {
            let n = size.div_ceil(chunk);
            let mut expected_start = 0;
            for i in 0..n {
                let r = chunk_range(i, n, chunk, size);
                assert_eq!(r.start, i * chunk);
                assert_eq!(r.start, expected_start);
                if i < n - 1 {
                    assert_eq!(r.end, (i + 1) * chunk);
                } else {
                    assert_eq!(r.end, size);
                }
                expected_start = r.end;
            }
        }
        assert_eq!(chunk_range(0, 1, 8, 20), 0..20);
    }

    #[test]
    fn test_part_path() {
        assert_eq!(part_path_for(Path::new("/data/a.csv")), PathBuf::from("/data/a.csv.part"));
    }

    type StoredObject = (Bytes, Option<EncryptionMetadata>, String);

    /// Objects and call log shared between backend instances
    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<HashMap<String, StoredObject>>,
        parts: Mutex<HashMap<u64, Bytes>>,
        calls: Mutex<Vec<String>>,
    }

    /// In-memory backend / 内存模拟后端
    struct MemoryBackend {
        store: Arc<MemoryStore>,
        fail_chunk: Option<u64>,
        fail_complete: bool,
        chunk_size: u64,
    }

    impl MemoryBackend {
        fn new(store: &Arc<MemoryStore>, chunk_size: u64) -> Self {
            Self {
                store: store.clone(),
                fail_chunk: None,
                fail_complete: false,
                chunk_size,
            }
        }
    }

    #[async_trait]
    impl ExpiryClassifier for MemoryBackend {
        fn has_expired_token(&self, _response: &HttpResponse) -> bool {
            false
        }
    }

    #[async_trait]
    impl BlobBackend for MemoryBackend {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn chunk_size(&self) -> u64 {
            self.chunk_size
        }

        async fn get_file_header(&self, name: &str) -> Result<Option<FileHeader>> {
            self.store.calls.lock().push(format!("head {}", name));
            Ok(self.store.objects.lock().get(name).map(|(data, enc, digest)| FileHeader {
                digest: Some(digest.clone()),
                content_length: Some(data.len() as u64),
                encryption_metadata: enc.clone(),
            }))
        }

        async fn initiate_multipart_upload(&self, _ctx: &UploadContext) -> Result<()> {
            self.store.calls.lock().push("initiate".to_string());
            Ok(())
        }

        async fn upload_chunk(&self, ctx: &UploadContext, chunk_id: u64, data: Bytes) -> Result<()> {
            if self.fail_chunk == Some(chunk_id) {
                return Err(anyhow!("chunk {}: exceeded maximum retries", chunk_id));
            }
            if ctx.is_multipart() {
                self.store.parts.lock().insert(chunk_id, data);
            } else {
                self.store.objects.lock().insert(
                    ctx.dst_file_name.clone(),
                    (data, ctx.encryption_metadata.clone(), ctx.digest.clone()),
                );
            }
            Ok(())
        }

        async fn complete_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
            self.store.calls.lock().push("complete".to_string());
            if self.fail_complete {
                return Err(anyhow!("complete rejected"));
            }
            let mut data = Vec::new();
            {
                let parts = self.store.parts.lock();
                for i in 0..ctx.num_chunks {
                    data.extend_from_slice(&parts[&i]);
                }
            }
            self.store.objects.lock().insert(
                ctx.dst_file_name.clone(),
                (Bytes::from(data), ctx.encryption_metadata.clone(), ctx.digest.clone()),
            );
            Ok(())
        }

        async fn abort_multipart_upload(&self, _ctx: &UploadContext) -> Result<()> {
            self.store.calls.lock().push("abort".to_string());
            self.store.parts.lock().clear();
            Ok(())
        }

        async fn download_chunk(&self, ctx: &DownloadContext, _chunk_id: u64, range: Option<Range<u64>>) -> Result<Bytes> {
            let objects = self.store.objects.lock();
            let (data, _, _) = objects.get(&ctx.src_file_name)
                .ok_or_else(|| anyhow!("not found"))?;
            Ok(match range {
                Some(r) => data.slice(r.start as usize..r.end as usize),
                None => data.clone(),
            })
        }
    }

    fn upload_meta(path: &Path, threshold: u64) -> TransferMeta {
        let mut meta = TransferMeta::new(
            base_name(&path.to_string_lossy()),
            path.to_string_lossy().to_string(),
            StageLocationType::LocalFs,
        );
        meta.dst_file_name = meta.name.clone();
        meta.overwrite = true;
        meta.multipart_threshold = threshold;
        meta
    }

    fn download_meta(name: &str, out: &Path, threshold: u64) -> TransferMeta {
        let mut meta = TransferMeta::new(name, name, StageLocationType::LocalFs);
        meta.dst_file_name = name.to_string();
        meta.local_location = Some(out.to_path_buf());
        meta.multipart_threshold = threshold;
        meta
    }

    async fn run_upload(client: &StorageClient) -> Result<()> {
        client.prepare_upload().await?;
        for i in 0..client.num_chunks() {
            let outcome = client.upload_chunk(i).await;
            client.record_chunk(i, &outcome);
        }
        client.finish_upload().await
    }

    async fn run_download(client: &StorageClient) {
        client.prepare_download().await.unwrap();
        for i in 0..client.num_chunks() {
            let outcome = client.download_chunk(i).await;
            client.record_chunk(i, &outcome);
        }
        client.finish_download().await;
    }

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let store = Arc::new(MemoryStore::default());
        let client = StorageClient::new(
            Box::new(MemoryBackend::new(&store, 300)),
            upload_meta(&path, 100),
            CommandType::Upload,
            ClientOptions::default(),
        );
        run_upload(&client).await.unwrap();

        let meta = client.meta();
        assert_eq!(client.num_chunks(), 4);
        assert_eq!(meta.result_status(), ResultStatus::Uploaded);
        assert_eq!(meta.dst_file_size, 1000);
        assert_eq!(client.tally().successful() + client.tally().failed(), 4);
        assert!(store.calls.lock().contains(&"complete".to_string()));

        let out = tempfile::tempdir().unwrap();
        let down = StorageClient::new(
            Box::new(MemoryBackend::new(&store, 300)),
            download_meta("data.csv", out.path(), 100),
            CommandType::Download,
            ClientOptions::default(),
        );
        run_download(&down).await;
        assert_eq!(down.num_chunks(), 4);
        assert_eq!(down.meta().result_status(), ResultStatus::Downloaded);
        assert_eq!(down.meta().dst_file_size, 1000);
        assert_eq!(std::fs::read(out.path().join("data.csv")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_failed_chunk_aborts_and_settles_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, vec![7u8; 1000]).unwrap();

        let store = Arc::new(MemoryStore::default());
        let mut backend = MemoryBackend::new(&store, 300);
        backend.fail_chunk = Some(2);
        let client = StorageClient::new(
            Box::new(backend),
            upload_meta(&path, 100),
            CommandType::Upload,
            ClientOptions::default(),
        );
        run_upload(&client).await.unwrap();

        let meta = client.meta();
        assert_eq!(meta.result_status(), ResultStatus::Error);
        assert_eq!(meta.dst_file_size, 0);
        assert!(meta.error_details.unwrap().contains("exceeded maximum retries"));
        assert_eq!(client.tally().failed(), 1);
        assert!(store.calls.lock().contains(&"abort".to_string()));
        assert!(store.objects.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_complete_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, vec![7u8; 1000]).unwrap();

        let store = Arc::new(MemoryStore::default());
        let mut backend = MemoryBackend::new(&store, 300);
        backend.fail_complete = true;
        let client = StorageClient::new(
            Box::new(backend),
            upload_meta(&path, 100),
            CommandType::Upload,
            ClientOptions::default(),
        );
        assert!(run_upload(&client).await.is_err());
        assert_eq!(client.meta().result_status(), ResultStatus::Error);
    }

    #[tokio::test]
    async fn test_prepare_upload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, b"a,b\n").unwrap();

        let store = Arc::new(MemoryStore::default());
        let client = StorageClient::new(
            Box::new(MemoryBackend::new(&store, 300)),
            upload_meta(&path, 100),
            CommandType::Upload,
            ClientOptions::default(),
        );
        client.prepare_upload().await.unwrap();
        client.prepare_upload().await.unwrap();
        assert_eq!(client.num_chunks(), 1);
        assert_eq!(store.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, b"a,b\n").unwrap();

        let store = Arc::new(MemoryStore::default());
        store.objects.lock().insert(
            "data.csv".to_string(),
            (Bytes::from_static(b"old"), None, "other".to_string()),
        );
        let mut meta = upload_meta(&path, 100);
        meta.overwrite = false;
        let client = StorageClient::new(
            Box::new(MemoryBackend::new(&store, 300)),
            meta,
            CommandType::Upload,
            ClientOptions::default(),
        );
        client.prepare_upload().await.unwrap();
        let meta = client.meta();
        assert_eq!(meta.result_status(), ResultStatus::Skipped);
        assert_eq!(meta.remote_status, Some(ResultStatus::Uploaded));
        assert_eq!(meta.dst_file_size, 0);
        assert_eq!(client.num_chunks(), 0);
    }

    #[tokio::test]
    async fn test_compressed_encrypted_round_trip_with_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        let content = b"id,value\n1,alpha\n2,beta\n".repeat(200);
        std::fs::write(&path, &content).unwrap();

        let material = EncryptionMaterial {
            query_stage_master_key: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                [3u8; 16],
            ),
            query_id: "q1".to_string(),
            smk_id: 9,
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let options = ClientOptions {
            progress: Some({
                let seen = seen.clone();
                Arc::new(move |_: &str, done: u64, total: u64| seen.lock().push((done, total)))
            }),
            ..Default::default()
        };

        let store = Arc::new(MemoryStore::default());
        let mut meta = upload_meta(&path, 1 << 30);
        meta.require_compress = true;
        meta.dst_file_name = "rows.csv.gz".to_string();
        meta.encryption_material = Some(material.clone());
        let client = StorageClient::new(Box::new(MemoryBackend::new(&store, 300)), meta, CommandType::Upload, options);
        run_upload(&client).await.unwrap();

        let uploaded = client.meta();
        assert_eq!(uploaded.result_status(), ResultStatus::Uploaded);
        assert!(uploaded.real_src_file_name.unwrap().ends_with("rows.csv.gz"));
        assert_eq!(seen.lock().last().copied(), Some((uploaded.upload_size, uploaded.upload_size)));

        let tmp = client.tmp_dir.lock().as_ref().map(|d| d.path().to_path_buf()).unwrap();
        client.delete_client_data();
        client.delete_client_data();
        assert!(!tmp.exists());

        let out = tempfile::tempdir().unwrap();
        let mut dmeta = download_meta("rows.csv.gz", out.path(), 1 << 30);
        dmeta.encryption_material = Some(material);
        let down = StorageClient::new(
            Box::new(MemoryBackend::new(&store, 300)),
            dmeta,
            CommandType::Download,
            ClientOptions::default(),
        );
        run_download(&down).await;

        assert_eq!(down.meta().result_status(), ResultStatus::Downloaded);
        let gz = std::fs::read(out.path().join("rows.csv.gz")).unwrap();
        assert_eq!(down.meta().dst_file_size, gz.len() as i64);
        let mut plain = Vec::new();
        std::io::Read::read_to_end(&mut flate2::read::GzDecoder::new(&gz[..]), &mut plain).unwrap();
        assert_eq!(plain, content);
        assert!(!out.path().join("rows.csv.gz.part").exists());
    }

    #[tokio::test]
    async fn test_download_not_found() {
        let out = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let client = StorageClient::new(
            Box::new(MemoryBackend::new(&store, 300)),
            download_meta("missing.csv", out.path(), 100),
            CommandType::Download,
            ClientOptions::default(),
        );
        client.prepare_download().await.unwrap();
        let meta = client.meta();
        assert_eq!(meta.result_status(), ResultStatus::NotFoundFile);
        assert_eq!(meta.dst_file_size, -1);
    }
}
