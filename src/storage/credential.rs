//! Shared storage credentials / 共享的存储凭证
//!
//! One instance is shared by every file of an invocation. When several
//! chunks see an expired token at once, only the first caller refreshes;
//! the others notice the newer timestamp and return immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

/// Source of fresh credentials / 凭证刷新来源
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> Result<HashMap<String, String>>;
}

pub struct StorageCredential {
    creds: RwLock<HashMap<String, String>>,
    timestamp: RwLock<Instant>,
    refresh_lock: tokio::sync::Mutex<()>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl StorageCredential {
    pub fn new(creds: HashMap<String, String>, refresher: Option<Arc<dyn CredentialRefresher>>) -> Self {
        Self {
            creds: RwLock::new(creds),
            timestamp: RwLock::new(Instant::now()),
            refresh_lock: tokio::sync::Mutex::new(()),
            refresher,
        }
    }

    /// Snapshot of all credential values / 获取凭证快照
    pub fn creds(&self) -> HashMap<String, String> {
        self.creds.read().clone()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.creds.read().get(key).cloned()
    }

    /// Time of the last refresh / 最近一次刷新的时间
    pub fn timestamp(&self) -> Instant {
        *self.timestamp.read()
    }

    /// Refresh unless someone already did after `older_than` / 刷新凭证
    ///
    /// Returns `true` when this call performed the refresh.
    pub async fn update(&self, older_than: Instant) -> Result<bool> {
        let _guard = self.refresh_lock.lock().await;
        if older_than < self.timestamp() {
            tracing::debug!("Credentials already refreshed by another request");
            return Ok(false);
        }

        let refresher = self.refresher.as_ref()
            .ok_or_else(|| anyhow!("Storage credentials expired and cannot be refreshed"))?;
        tracing::info!("Refreshing expired storage credentials");
        let creds = refresher.refresh().await?;
        *self.creds.write() = creds;
        *self.timestamp.write() = Instant::now();
        Ok(true)
    }
}
