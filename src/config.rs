//! Application configuration module / 应用配置模块
//!
//! Manages transfer configuration loaded from config.json
//! Creates default config file on first run / 首次运行时创建默认配置文件

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Global configuration instance / 全局配置实例
static CONFIG: OnceCell<Arc<RwLock<AppConfig>>> = OnceCell::new();

/// Application configuration / 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Transfer configuration / 传输配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Log configuration / 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// Transfer configuration / 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Concurrent chunk transfers / 并发分片数
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Files at or above this size are split into chunks / 分片阈值（字节）
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    /// Attempts per operation / 每个操作的最大尝试次数
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Backoff unit in milliseconds / 退避时间单位（毫秒）
    #[serde(default = "default_sleep_unit_ms")]
    pub sleep_unit_ms: u64,
    /// Backoff cap in units / 退避上限
    #[serde(default = "default_max_sleep_secs")]
    pub max_sleep_secs: u64,
    #[serde(default = "default_presigned_url_retry_limit")]
    pub presigned_url_retry_limit: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Use the regional S3 host / 使用S3区域域名
    #[serde(default)]
    pub use_s3_regional_url: bool,
    /// null probes the bucket / 为空时自动探测加速配置
    #[serde(default)]
    pub use_accelerate_endpoint: Option<bool>,
    /// Fail the invocation when any file fails / 任一文件失败时返回错误
    #[serde(default = "default_true")]
    pub raise_on_error: bool,
    #[serde(default)]
    pub force_overwrite: bool,
    #[serde(default)]
    pub skip_upload_on_content_match: bool,
    /// Temp directory root, system temp when empty / 临时目录
    #[serde(default)]
    pub temp_dir: Option<String>,
}

/// Log configuration / 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter used when RUST_LOG is not set / 日志过滤规则
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_parallel() -> usize {
    4
}

fn default_multipart_threshold() -> u64 {
    64 * 1024 * 1024
}

fn default_max_retry() -> u32 {
    5
}

fn default_sleep_unit_ms() -> u64 {
    1000
}

fn default_max_sleep_secs() -> u64 {
    16
}

fn default_presigned_url_retry_limit() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_log_filter() -> String {
    "stage_transfer=info".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            multipart_threshold: default_multipart_threshold(),
            max_retry: default_max_retry(),
            sleep_unit_ms: default_sleep_unit_ms(),
            max_sleep_secs: default_max_sleep_secs(),
            presigned_url_retry_limit: default_presigned_url_retry_limit(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            use_s3_regional_url: false,
            use_accelerate_endpoint: None,
            raise_on_error: true,
            force_overwrite: false,
            skip_upload_on_content_match: false,
            temp_dir: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Get the config file path / 获取配置文件路径
fn get_config_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.json")
}

/// Load configuration from file, or create default if not exists / 加载配置文件，不存在则创建默认配置
pub fn load_config() -> Result<AppConfig, String> {
    let config_path = get_config_path();

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file: {}", e))?;

        tracing::info!("Loaded configuration from {:?}", config_path);
        Ok(config)
    } else {
        // Create default config / 创建默认配置
        let config = AppConfig::default();
        save_config(&config)?;
        tracing::info!("Created default configuration at {:?}", config_path);
        Ok(config)
    }
}

/// Save configuration to file / 保存配置到文件
pub fn save_config(config: &AppConfig) -> Result<(), String> {
    let config_path = get_config_path();

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    std::fs::write(&config_path, content)
        .map_err(|e| format!("Failed to write config file: {}", e))?;

    Ok(())
}

/// Initialize global configuration / 初始化全局配置
pub fn init_config() -> Result<Arc<RwLock<AppConfig>>, String> {
    let config = load_config()?;

    let config_arc = Arc::new(RwLock::new(config));

    CONFIG.set(config_arc.clone())
        .map_err(|_| "Config already initialized".to_string())?;

    Ok(config_arc)
}

/// Get global configuration instance / 获取全局配置实例
pub fn get_config() -> Arc<RwLock<AppConfig>> {
    CONFIG.get_or_init(|| {
        let config = load_config().unwrap_or_default();
        Arc::new(RwLock::new(config))
    }).clone()
}

/// Get a read-only snapshot of current config / 获取当前配置的只读快照
pub fn config() -> AppConfig {
    get_config().read().clone()
}
