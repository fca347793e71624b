// Stage backends / 存储后端驱动
pub mod local;
pub mod s3;
pub mod azure;
pub mod gcs;

use crate::storage::BackendRegistry;

/// Register all backends to the registry / 注册所有后端
pub async fn register_all(registry: &BackendRegistry) -> anyhow::Result<()> {
    // Register local filesystem stage / 注册本地文件系统存储
    registry.register_factory(Box::new(local::LocalBackendFactory)).await?;
    // Register S3 backend (SigV4) / 注册S3对象存储
    registry.register_factory(Box::new(s3::S3BackendFactory)).await?;
    // Register Azure Blob backend (SAS token) / 注册Azure Blob存储
    registry.register_factory(Box::new(azure::AzureBackendFactory)).await?;
    // Register GCS backend (access token or presigned URL) / 注册GCS存储
    registry.register_factory(Box::new(gcs::GcsBackendFactory)).await?;
    Ok(())
}
