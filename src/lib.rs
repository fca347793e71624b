pub mod config;
pub mod error;
pub mod utils;
pub mod compression;
pub mod file_util;
pub mod encryption;
pub mod storage;
pub mod transfer;

// Backend modules (point to project root drivers via path attribute) / 后端驱动模块
#[path = "../drivers/mod.rs"]
pub mod drivers;

pub use error::TransferError;
pub use transfer::{FileTransferAgent, TransferOptions};

// Register all stage backends (call unified registration function from drivers module) / 注册所有存储后端
pub async fn register_backends(registry: &storage::BackendRegistry) -> anyhow::Result<()> {
    drivers::register_all(registry).await
}
