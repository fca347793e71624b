use std::ops::Range;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::encryption::EncryptionMetadata;
use crate::file_util;
use crate::storage::http::HttpResponse;
use crate::storage::{BlobBackend, DownloadContext, ExpiryClassifier, FileHeader, UploadContext};

const CHUNK_SIZE: u64 = 4 * 1024 * 1024; // 4MB per chunk
const SIDECAR_SUFFIX: &str = ".stagemeta.json";
const UPLOAD_SUFFIX: &str = ".uploading";

/// Metadata kept next to every staged file / 与文件一起保存的元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    digest: String,
    #[serde(default)]
    encryption_metadata: Option<EncryptionMetadata>,
}

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve a stage name below the root, rejecting `..` / 规范化路径
    fn normalize_path(&self, name: &str) -> Result<PathBuf> {
        let name = name.trim_start_matches('/').replace('\\', "/");
        let mut normalized = PathBuf::new();
        for component in Path::new(&name).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                _ => return Err(anyhow!("Access path exceeds stage directory: {}", name)),
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(anyhow!("Empty stage file name"));
        }
        Ok(self.root.join(normalized))
    }

    fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(suffix);
        path.with_file_name(name)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await
                .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }
        Ok(())
    }

    async fn read_sidecar(path: &Path) -> Option<Sidecar> {
        let content = tokio::fs::read(Self::with_suffix(path, SIDECAR_SUFFIX)).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                tracing::warn!("Ignoring unreadable metadata for {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn write_sidecar(path: &Path, ctx: &UploadContext) -> Result<()> {
        let sidecar = Sidecar {
            digest: ctx.digest.clone(),
            encryption_metadata: ctx.encryption_metadata.clone(),
        };
        let content = serde_json::to_vec_pretty(&sidecar)?;
        tokio::fs::write(Self::with_suffix(path, SIDECAR_SUFFIX), content).await
            .map_err(|e| anyhow!("Failed to write metadata for {}: {}", path.display(), e))?;
        Ok(())
    }
}

#[async_trait]
impl ExpiryClassifier for LocalBackend {
    fn has_expired_token(&self, _response: &HttpResponse) -> bool {
        false
    }
}

#[async_trait]
impl BlobBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn chunk_size(&self) -> u64 {
        CHUNK_SIZE
    }

    async fn get_file_header(&self, name: &str) -> Result<Option<FileHeader>> {
        let path = self.normalize_path(name)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(anyhow!("Failed to stat {}: {}", path.display(), e)),
        };

        let (digest, encryption_metadata) = match Self::read_sidecar(&path).await {
            Some(sidecar) => (sidecar.digest, sidecar.encryption_metadata),
            None => {
                let digest_path = path.clone();
                let (digest, _) = tokio::task::spawn_blocking(move || file_util::digest_and_size_for_file(&digest_path))
                    .await
                    .map_err(|e| anyhow!("Digest task failed: {}", e))??;
                (digest, None)
            }
        };

        Ok(Some(FileHeader {
            digest: Some(digest),
            content_length: Some(metadata.len()),
            encryption_metadata,
        }))
    }

    async fn initiate_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        let path = self.normalize_path(&ctx.dst_file_name)?;
        Self::ensure_parent(&path).await?;
        let staging = Self::with_suffix(&path, UPLOAD_SUFFIX);
        let file = tokio::fs::File::create(&staging).await
            .map_err(|e| anyhow!("Failed to create {}: {}", staging.display(), e))?;
        file.set_len(ctx.upload_size).await?;
        tracing::debug!("Local multipart upload started: {}", staging.display());
        Ok(())
    }

    async fn upload_chunk(&self, ctx: &UploadContext, chunk_id: u64, data: Bytes) -> Result<()> {
        let path = self.normalize_path(&ctx.dst_file_name)?;
        if !ctx.is_multipart() {
            Self::ensure_parent(&path).await?;
            tokio::fs::write(&path, &data).await
                .map_err(|e| anyhow!("Failed to write {}: {}", path.display(), e))?;
            return Self::write_sidecar(&path, ctx).await;
        }

        let staging = Self::with_suffix(&path, UPLOAD_SUFFIX);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&staging)
            .await
            .map_err(|e| anyhow!("Failed to open {}: {}", staging.display(), e))?;
        file.seek(std::io::SeekFrom::Start(chunk_id * CHUNK_SIZE)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn complete_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        let path = self.normalize_path(&ctx.dst_file_name)?;
        let staging = Self::with_suffix(&path, UPLOAD_SUFFIX);
        tokio::fs::rename(&staging, &path).await
            .map_err(|e| anyhow!("Failed to move {} into place: {}", path.display(), e))?;
        Self::write_sidecar(&path, ctx).await
    }

    async fn abort_multipart_upload(&self, ctx: &UploadContext) -> Result<()> {
        let path = self.normalize_path(&ctx.dst_file_name)?;
        let staging = Self::with_suffix(&path, UPLOAD_SUFFIX);
        match tokio::fs::remove_file(&staging).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("Failed to remove {}: {}", staging.display(), e)),
        }
    }

    async fn download_chunk(
        &self,
        ctx: &DownloadContext,
        _chunk_id: u64,
        range: Option<Range<u64>>,
    ) -> Result<Bytes> {
        let path = self.normalize_path(&ctx.src_file_name)?;
        let mut file = tokio::fs::File::open(&path).await
            .map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;

        let mut buf = Vec::new();
        match range {
            Some(r) => {
                file.seek(std::io::SeekFrom::Start(r.start)).await?;
                buf.resize((r.end - r.start) as usize, 0);
                file.read_exact(&mut buf).await
                    .map_err(|e| anyhow!("Failed to read {} at {}: {}", path.display(), r.start, e))?;
            }
            None => {
                file.read_to_end(&mut buf).await?;
            }
        }
        Ok(Bytes::from(buf))
    }
}
