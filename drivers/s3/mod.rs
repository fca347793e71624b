//! S3 stage backend / S3存储后端
//!
//! Requests are signed with `rust-s3` and sent through the shared retry loop.

pub mod config;
pub mod driver;
pub mod factory;

pub use config::S3Location;
pub use driver::S3Backend;
pub use factory::S3BackendFactory;
