//! GCS驱动工厂 / GCS backend factory

use anyhow::Result;

use crate::storage::{BackendFactory, BlobBackend, StageContext, StageLocationType};
use super::driver::{GcsBackend, GcsLocation};

pub struct GcsBackendFactory;

impl BackendFactory for GcsBackendFactory {
    fn location_type(&self) -> StageLocationType {
        StageLocationType::Gcs
    }

    fn create_backend(&self, ctx: StageContext) -> Result<Box<dyn BlobBackend>> {
        let location = GcsLocation::from_context(&ctx)?;
        Ok(Box::new(GcsBackend::new(location, ctx)))
    }
}
