//! 本地存储后端工厂 / Local backend factory

use anyhow::Result;

use crate::storage::{BackendFactory, BlobBackend, StageContext, StageLocationType};
use crate::utils::expand_user;
use super::driver::LocalBackend;

pub struct LocalBackendFactory;

impl BackendFactory for LocalBackendFactory {
    fn location_type(&self) -> StageLocationType {
        StageLocationType::LocalFs
    }

    fn create_backend(&self, ctx: StageContext) -> Result<Box<dyn BlobBackend>> {
        let root = expand_user(&ctx.stage_info.location);
        Ok(Box::new(LocalBackend::new(root)))
    }
}
