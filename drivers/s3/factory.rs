//! S3驱动工厂 / S3 backend factory

use anyhow::Result;

use crate::storage::{BackendFactory, BlobBackend, StageContext, StageLocationType};
use super::config::S3Location;
use super::driver::S3Backend;

pub struct S3BackendFactory;

impl BackendFactory for S3BackendFactory {
    fn location_type(&self) -> StageLocationType {
        StageLocationType::S3
    }

    fn create_backend(&self, ctx: StageContext) -> Result<Box<dyn BlobBackend>> {
        let location = S3Location::from_context(&ctx)?;
        Ok(Box::new(S3Backend::new(location, &ctx)))
    }
}
