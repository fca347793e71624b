//! Azure Blob stage backend / Azure Blob存储后端
//!
//! Requests are authorized by the stage's SAS token, appended to every URL.

pub mod driver;
pub mod factory;

pub use driver::{AzureBackend, AzureLocation};
pub use factory::AzureBackendFactory;
