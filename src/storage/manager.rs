use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::RwLock;

use super::{BlobBackend, StageContext, StageLocationType};

/// Backend factory trait / 后端工厂 trait
pub trait BackendFactory: Send + Sync {
    /// Stage type served by this factory / 工厂对应的存储类型
    fn location_type(&self) -> StageLocationType;

    /// 创建后端实例 / Create a backend for one file
    fn create_backend(&self, ctx: StageContext) -> Result<Box<dyn BlobBackend>>;
}

/// Backend registry (maps stage types to factories) / 后端注册表
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: Arc<RwLock<HashMap<StageLocationType, Arc<dyn BackendFactory>>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register backend factory / 注册后端工厂
    pub async fn register_factory(&self, factory: Box<dyn BackendFactory>) -> Result<()> {
        let location_type = factory.location_type();
        let mut factories = self.factories.write().await;
        factories.insert(location_type, Arc::from(factory));

        tracing::info!("Backend factory registered: {}", location_type);
        Ok(())
    }

    /// Create a backend for the given stage type / 创建后端实例
    pub async fn create_backend(&self, ctx: StageContext) -> Result<Box<dyn BlobBackend>> {
        let location_type: StageLocationType = ctx.stage_info.location_type.parse()?;
        let factory = {
            let factories = self.factories.read().await;
            factories.get(&location_type)
                .cloned()
                .ok_or_else(|| anyhow!("Backend type not registered: {}", location_type))?
        };

        let backend = factory.create_backend(ctx)
            .map_err(|e| anyhow!("Failed to create {} backend: {}", location_type, e))?;
        tracing::debug!("Backend created: {}", backend.name());
        Ok(backend)
    }

    pub async fn is_registered(&self, location_type: StageLocationType) -> bool {
        self.factories.read().await.contains_key(&location_type)
    }
}
