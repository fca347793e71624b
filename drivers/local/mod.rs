//! Local filesystem stage / 本地文件系统存储

pub mod driver;
pub mod factory;

pub use driver::LocalBackend;
pub use factory::LocalBackendFactory;
