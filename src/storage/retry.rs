//! Shared request retry loop / 通用请求重试逻辑
//!
//! Every remote backend sends its requests through [`RequestRetrier::send`].
//! Backends only decide what an expired token or an expired presigned URL
//! looks like; the loop decides when to back off, refresh, or give up.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use super::credential::StorageCredential;
use super::http::{HttpRequest, HttpResponse, HttpTransport};

/// Statuses worth retrying after a backoff / 需要退避重试的状态码
pub const TRANSIENT_HTTP_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Retry tuning / 重试参数
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per operation before giving up / 每个操作的最大尝试次数
    pub max_retry: u32,
    /// Length of one backoff unit / 退避时间单位
    pub sleep_unit: Duration,
    /// Cap on the backoff, in units / 退避上限
    pub max_sleep_units: u64,
    /// Consecutive presigned URL renewals allowed before the expiry is
    /// reported as an error / 连续刷新预签名URL的次数上限
    pub presigned_url_retry_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 5,
            sleep_unit: Duration::from_secs(1),
            max_sleep_units: 16,
            presigned_url_retry_limit: 1,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following `attempt` (0-based): 1,2,4,8,16,16...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let units = 2u64.checked_pow(attempt)
            .unwrap_or(u64::MAX)
            .min(self.max_sleep_units);
        self.sleep_unit.saturating_mul(units.min(u32::MAX as u64) as u32)
    }
}

/// Identifies an operation with its own retry budget / 重试计数的键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RetryKey {
    Head,
    Chunk(u64),
    Initiate,
    Complete,
    Abort,
    Accelerate,
}

impl fmt::Display for RetryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryKey::Head => write!(f, "HEAD"),
            RetryKey::Chunk(id) => write!(f, "chunk {}", id),
            RetryKey::Initiate => write!(f, "Initiate"),
            RetryKey::Complete => write!(f, "Complete"),
            RetryKey::Abort => write!(f, "Abort"),
            RetryKey::Accelerate => write!(f, "accelerate"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{operation}: exceeded maximum retries ({attempts}), last error: {last_error}")]
    ExceededMaxRetries {
        operation: String,
        attempts: u32,
        last_error: String,
    },
    #[error("{operation}: presigned URL expired again right after renewal")]
    PresignedUrlExpired { operation: String },
}

/// Backend specific response classification / 各存储后端的响应判定
#[async_trait]
pub trait ExpiryClassifier: Send + Sync {
    /// The response says the credentials have expired / 凭证是否过期
    fn has_expired_token(&self, response: &HttpResponse) -> bool;

    /// The response says the presigned URL has expired / 预签名URL是否过期
    fn has_expired_presigned_url(&self, _response: &HttpResponse) -> bool {
        false
    }

    /// Fetch a new presigned URL / 获取新的预签名URL
    async fn update_presigned_url(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-client retry state / 每个客户端的重试状态
pub struct RequestRetrier {
    transport: Arc<dyn HttpTransport>,
    credential: Arc<StorageCredential>,
    policy: RetryPolicy,
    retry_count: Mutex<HashMap<RetryKey, u32>>,
}

impl RequestRetrier {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credential: Arc<StorageCredential>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            credential,
            policy,
            retry_count: Mutex::new(HashMap::new()),
        }
    }

    pub fn credential(&self) -> &Arc<StorageCredential> {
        &self.credential
    }

    /// Attempts spent so far on an operation / 某操作已消耗的重试次数
    pub fn retry_count(&self, key: &RetryKey) -> u32 {
        self.retry_count.lock().get(key).copied().unwrap_or(0)
    }

    fn bump(&self, key: &RetryKey) {
        *self.retry_count.lock().entry(key.clone()).or_insert(0) += 1;
    }

    /// Send a request, retrying per the shared policy / 按统一策略发送请求
    ///
    /// `build` is called before every attempt so that signatures and
    /// presigned URLs are always fresh. The returned response may still be
    /// a non-retryable failure; callers check its status.
    pub async fn send<F>(
        &self,
        key: RetryKey,
        classifier: &dyn ExpiryClassifier,
        build: F,
    ) -> Result<HttpResponse>
    where
        F: Fn() -> Result<HttpRequest> + Send + Sync,
    {
        self.send_with(key, classifier, || std::future::ready(build())).await
    }

    /// Like [`send`](Self::send), for builders that sign asynchronously / 异步构建请求
    pub async fn send_with<F, Fut>(
        &self,
        key: RetryKey,
        classifier: &dyn ExpiryClassifier,
        build: F,
    ) -> Result<HttpResponse>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<HttpRequest>> + Send,
    {
        self.retry_count.lock().insert(key.clone(), 0);
        let mut presigned_renewals = 0u32;
        let mut last_error = String::new();

        loop {
            let attempt = self.retry_count(&key);
            if attempt >= self.policy.max_retry {
                return Err(RetryError::ExceededMaxRetries {
                    operation: key.to_string(),
                    attempts: attempt,
                    last_error,
                }
                .into());
            }

            let cur_timestamp = self.credential.timestamp();
            let request = build().await?;
            let method = request.method.to_string();

            match self.transport.send(request).await {
                Ok(response) => {
                    if classifier.has_expired_presigned_url(&response) {
                        if presigned_renewals >= self.policy.presigned_url_retry_limit {
                            return Err(RetryError::PresignedUrlExpired {
                                operation: key.to_string(),
                            }
                            .into());
                        }
                        presigned_renewals += 1;
                        tracing::info!("{} {}: presigned URL expired, renewing", method, key);
                        classifier.update_presigned_url().await?;
                        continue;
                    }
                    presigned_renewals = 0;

                    if TRANSIENT_HTTP_STATUS.contains(&response.status) {
                        last_error = format!("HTTP {} {}", response.status, response.reason);
                        self.back_off(&key, attempt, &method, &last_error).await;
                        continue;
                    }

                    if classifier.has_expired_token(&response) {
                        tracing::info!("{} {}: token expired, renewing credentials", method, key);
                        last_error = format!("HTTP {} expired token", response.status);
                        self.credential.update(cur_timestamp).await?;
                        self.bump(&key);
                        continue;
                    }

                    return Ok(response);
                }
                Err(e) => {
                    presigned_renewals = 0;
                    last_error = e.to_string();
                    self.back_off(&key, attempt, &method, &last_error).await;
                }
            }
        }
    }

    async fn back_off(&self, key: &RetryKey, attempt: u32, method: &str, reason: &str) {
        let delay = self.policy.backoff(attempt);
        tracing::warn!(
            "{} {} failed ({}), retry {}/{} in {:?}",
            method,
            key,
            reason,
            attempt + 1,
            self.policy.max_retry,
            delay
        );
        tokio::time::sleep(delay).await;
        self.bump(key);
    }
}
