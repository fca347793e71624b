//! Google Cloud Storage stage backend / GCS存储后端
//!
//! Authorized either by an OAuth access token or by per-file presigned URLs.
//! Objects always go up in a single PUT.

pub mod driver;
pub mod factory;

pub use driver::{GcsBackend, GcsLocation};
pub use factory::GcsBackendFactory;
