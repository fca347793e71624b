//! Azure驱动工厂 / Azure backend factory

use anyhow::Result;

use crate::storage::{BackendFactory, BlobBackend, StageContext, StageLocationType};
use super::driver::{AzureBackend, AzureLocation};

pub struct AzureBackendFactory;

impl BackendFactory for AzureBackendFactory {
    fn location_type(&self) -> StageLocationType {
        StageLocationType::Azure
    }

    fn create_backend(&self, ctx: StageContext) -> Result<Box<dyn BlobBackend>> {
        let location = AzureLocation::from_context(&ctx)?;
        Ok(Box::new(AzureBackend::new(location, &ctx)))
    }
}
