//! Transfer request parsing / 传输请求解析
//!
//! Turns the warehouse's transfer response into one [`TransferMeta`] per
//! file. Every validation failure here is reported before any byte moves.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::meta::{CommandType, TransferMeta};
use crate::compression::{self, CompressionType, GZIP};
use crate::encryption::EncryptionMaterial;
use crate::error::TransferError;
use crate::storage::{CredentialRefresher, StageInfo, StageLocationType};
use crate::utils::{base_name, expand_user, expand_wildcard, has_wildcard, strip_first_component};

/// Response to a PUT/GET command / 传输命令的响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferResponse {
    #[serde(default)]
    pub data: Option<TransferData>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Encryption material, a list for GET and a single object for PUT
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncryptionMaterials {
    Many(Vec<Option<EncryptionMaterial>>),
    One(EncryptionMaterial),
}

impl EncryptionMaterials {
    pub fn into_vec(self) -> Vec<EncryptionMaterial> {
        match self {
            EncryptionMaterials::Many(list) => list.into_iter().flatten().collect(),
            EncryptionMaterials::One(material) => vec![material],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferData {
    pub command: String,
    #[serde(rename = "src_locations", default)]
    pub src_locations: Option<Vec<String>>,
    pub stage_info: StageInfo,
    #[serde(default)]
    pub encryption_material: Option<EncryptionMaterials>,
    #[serde(default)]
    pub presigned_urls: Option<Vec<Option<String>>>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub parallel: Option<usize>,
    #[serde(default)]
    pub auto_compress: Option<bool>,
    #[serde(default)]
    pub source_compression: Option<String>,
    #[serde(default)]
    pub local_location: Option<String>,
}

/// Executes a warehouse command and returns its transfer response / 命令执行器
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<TransferResponse>;
}

/// Refreshes credentials by re-running the original command / 通过重新执行命令刷新凭证
pub struct CommandRefresher {
    executor: Arc<dyn CommandExecutor>,
    command: String,
}

impl CommandRefresher {
    pub fn new(executor: Arc<dyn CommandExecutor>, command: impl Into<String>) -> Self {
        Self {
            executor,
            command: command.into(),
        }
    }
}

#[async_trait]
impl CredentialRefresher for CommandRefresher {
    async fn refresh(&self) -> Result<HashMap<String, String>> {
        tracing::debug!("Renewing expired storage token");
        let response = self.executor.execute(&self.command).await?;
        let data = response.data
            .ok_or_else(|| anyhow!("Credential refresh returned no data"))?;
        Ok(data.stage_info.creds)
    }
}

/// A validated transfer request / 校验后的传输请求
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub command_type: CommandType,
    pub location_type: StageLocationType,
    pub stage_info: StageInfo,
    pub metas: Vec<TransferMeta>,
    /// Requested network parallelism, if the response carried one
    pub parallel: Option<usize>,
    pub overwrite: bool,
}

impl TransferRequest {
    /// Parse and validate a transfer response / 解析并校验传输响应
    ///
    /// `source_stream` replaces the file named by the first source location
    /// when uploading from memory.
    pub fn parse(response: &TransferResponse, source_stream: Option<Bytes>) -> Result<Self, TransferError> {
        let data = response.data.as_ref()
            .ok_or_else(|| TransferError::InvalidRequest("Failed to parse server's response".to_string()))?;

        let command_type = match data.command.to_uppercase().as_str() {
            "UPLOAD" => CommandType::Upload,
            "DOWNLOAD" => CommandType::Download,
            other => return Err(TransferError::InvalidCommandType(other.to_string())),
        };
        let src_locations = data.src_locations.as_ref()
            .ok_or_else(|| TransferError::InvalidRequest("Failed to parse the location".to_string()))?;
        let location_type: StageLocationType = data.stage_info.location_type.parse()?;
        let materials = data.encryption_material.clone()
            .map(EncryptionMaterials::into_vec)
            .unwrap_or_default();

        let metas = match command_type {
            CommandType::Upload => {
                let mut metas = match source_stream {
                    Some(stream) => upload_meta_from_stream(src_locations, stream, location_type)?,
                    None => upload_metas_from_files(src_locations, location_type)?,
                };
                for meta in metas.iter_mut() {
                    meta.encryption_material = materials.first().cloned();
                    meta.presigned_url = data.stage_info.presigned_url.clone();
                    meta.overwrite = data.overwrite;
                }
                let source_compression = data.source_compression.as_deref().unwrap_or("auto_detect");
                plan_compression(&mut metas, source_compression, data.auto_compress.unwrap_or(true))?;
                metas
            }
            CommandType::Download => {
                download_metas(data, src_locations, materials, location_type)?
            }
        };

        Ok(Self {
            command_type,
            location_type,
            stage_info: data.stage_info.clone(),
            metas,
            parallel: data.parallel,
            overwrite: data.overwrite,
        })
    }
}

fn upload_meta_from_stream(
    src_locations: &[String],
    stream: Bytes,
    location_type: StageLocationType,
) -> Result<Vec<TransferMeta>, TransferError> {
    let src = src_locations.first()
        .ok_or_else(|| TransferError::FileNotExists("None".to_string()))?;
    let mut meta = TransferMeta::new(base_name(src), src.clone(), location_type);
    meta.src_file_size = stream.len() as u64;
    meta.src_stream = Some(stream);
    Ok(vec![meta])
}

/// Expand `~` and wildcards, then dedupe and sort / 展开并去重源文件路径
fn expand_upload_sources(src_locations: &[String]) -> Result<Vec<PathBuf>, TransferError> {
    let cwd = std::env::current_dir()?;
    let mut files = BTreeSet::new();
    for location in src_locations {
        let mut path = expand_user(location);
        if path.is_relative() {
            path = cwd.join(path);
        }
        if has_wildcard(&path) {
            files.extend(expand_wildcard(&path)?);
        } else {
            files.insert(path);
        }
    }
    Ok(files.into_iter().collect())
}

fn upload_metas_from_files(
    src_locations: &[String],
    location_type: StageLocationType,
) -> Result<Vec<TransferMeta>, TransferError> {
    let files = expand_upload_sources(src_locations)?;
    if files.is_empty() {
        return Err(TransferError::FileNotExists(src_locations.join(", ")));
    }

    let mut metas = Vec::with_capacity(files.len());
    for path in files {
        let display = path.to_string_lossy().to_string();
        if !path.exists() {
            return Err(TransferError::FileNotExists(display));
        }
        if path.is_dir() {
            return Err(TransferError::NotAFile(display));
        }
        let size = std::fs::metadata(&path)?.len();
        let mut meta = TransferMeta::new(base_name(&display), display, location_type);
        meta.src_file_size = size;
        metas.push(meta);
    }
    Ok(metas)
}

/// Decide source/destination compression for each upload / 决定每个文件的压缩方式
fn plan_compression(
    metas: &mut [TransferMeta],
    source_compression: &str,
    auto_compress: bool,
) -> Result<(), TransferError> {
    let source_compression = source_compression.to_lowercase();
    let (auto_detect, declared) = match source_compression.as_str() {
        "auto_detect" | "" => (true, None),
        "none" => (false, None),
        subtype => {
            let found = compression::lookup_by_mime_subtype(subtype)
                .ok_or_else(|| TransferError::UnknownCompressionType(subtype.to_string()))?;
            if !found.is_supported {
                return Err(TransferError::CompressionNotSupported(found.name.to_string()));
            }
            (false, Some(found))
        }
    };

    for meta in metas.iter_mut() {
        let detected: Option<&'static CompressionType> = if auto_detect {
            let found = match &meta.src_stream {
                Some(stream) => compression::detect_bytes(&meta.name, stream),
                None => compression::detect_file(Path::new(&meta.src_file_name))?,
            };
            if let Some(found) = found {
                tracing::debug!("Detected compression {}: file={}", found.name, meta.src_file_name);
            }
            found
        } else {
            declared
        };

        match detected {
            Some(found) if !found.is_supported => {
                return Err(TransferError::CompressionNotSupported(found.name.to_string()));
            }
            Some(found) => {
                meta.src_compression_type = Some(found);
                meta.dst_compression_type = Some(found);
                meta.require_compress = false;
                meta.dst_file_name = meta.name.clone();
            }
            None if auto_compress => {
                meta.src_compression_type = None;
                meta.dst_compression_type = Some(&GZIP);
                meta.require_compress = true;
                meta.dst_file_name = format!("{}{}", meta.name, GZIP.file_extension);
            }
            None => {
                meta.src_compression_type = None;
                meta.dst_compression_type = None;
                meta.require_compress = false;
                meta.dst_file_name = meta.name.clone();
            }
        }
    }
    Ok(())
}

fn download_metas(
    data: &TransferData,
    src_locations: &[String],
    materials: Vec<EncryptionMaterial>,
    location_type: StageLocationType,
) -> Result<Vec<TransferMeta>, TransferError> {
    if !materials.is_empty() && materials.len() != src_locations.len() {
        return Err(TransferError::EncryptionMaterialMismatch {
            files: src_locations.len(),
            materials: materials.len(),
        });
    }

    let local_location = data.local_location.as_deref()
        .ok_or_else(|| TransferError::InvalidRequest("No local location for download".to_string()))?;
    let local_location = expand_user(local_location);
    if !local_location.is_dir() {
        return Err(TransferError::LocalPathNotDirectory(local_location.to_string_lossy().to_string()));
    }

    let presigned_urls = data.presigned_urls.clone().unwrap_or_default();
    let mut basename_counts: HashMap<String, usize> = HashMap::new();
    let mut metas = Vec::with_capacity(src_locations.len());

    for (idx, src) in src_locations.iter().enumerate() {
        if src.is_empty() {
            continue;
        }
        let name = base_name(src);
        *basename_counts.entry(name.clone()).or_insert(0) += 1;

        let mut meta = TransferMeta::new(name, src.clone(), location_type);
        meta.dst_file_name = strip_first_component(src);
        meta.local_location = Some(local_location.clone());
        meta.presigned_url = presigned_urls.get(idx).cloned().flatten();
        meta.encryption_material = materials.get(idx).cloned();
        meta.overwrite = data.overwrite;
        metas.push(meta);
    }

    let mut duplicates: Vec<&String> = basename_counts.iter()
        .filter(|(_, count)| **count > 1)
        .map(|(name, _)| name)
        .collect();
    if !duplicates.is_empty() {
        duplicates.sort();
        tracing::warn!(
            "Downloading multiple files with the same name could cause failures. File names with multiple entries: {:?}",
            duplicates
        );
    }
    Ok(metas)
}
