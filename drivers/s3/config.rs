//! S3 stage location / S3存储位置

use anyhow::{anyhow, Result};

use crate::storage::{split_location, StageContext};

/// Where a stage lives in S3 / S3存储位置
#[derive(Debug, Clone, PartialEq)]
pub struct S3Location {
    pub bucket: String,
    /// Key prefix, empty or ending in `/`
    pub prefix: String,
    pub region: String,
    /// Custom endpoint host from the stage, without scheme
    pub end_point: Option<String>,
    pub use_regional_url: bool,
}

impl S3Location {
    pub fn from_context(ctx: &StageContext) -> Result<Self> {
        let info = &ctx.stage_info;
        let (bucket, prefix) = split_location(&info.location);
        if bucket.is_empty() {
            return Err(anyhow!("Missing bucket in stage location: {}", info.location));
        }
        let end_point = info.end_point.as_deref()
            .map(|e| e.trim_start_matches("https://").trim_start_matches("http://").trim_end_matches('/'))
            .filter(|e| !e.is_empty())
            .map(|e| e.to_string());
        Ok(Self {
            bucket,
            prefix,
            region: info.region.clone().unwrap_or_else(|| "us-east-1".to_string()),
            end_point,
            use_regional_url: ctx.use_s3_regional_url,
        })
    }

    pub fn is_china_region(&self) -> bool {
        self.region.starts_with("cn-")
    }

    /// Service endpoint the bucket is addressed under / 服务端点
    pub fn endpoint(&self, accelerate: bool) -> String {
        if let Some(end_point) = &self.end_point {
            return end_point.clone();
        }
        if self.is_china_region() {
            return format!("s3.{}.amazonaws.com.cn", self.region);
        }
        // Regional URLs pin the host, acceleration never applies
        if self.use_regional_url {
            return format!("s3.{}.amazonaws.com", self.region);
        }
        if accelerate {
            return "s3-accelerate.amazonaws.com".to_string();
        }
        "s3.amazonaws.com".to_string()
    }

    /// Host for object requests / 对象请求使用的域名
    pub fn host(&self, accelerate: bool) -> String {
        format!("{}.{}", self.bucket, self.endpoint(accelerate))
    }

    /// Object key of a stage file / 获取对象键
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.trim_start_matches('/'))
    }

    /// Full object URL with every key segment encoded / 对象完整URL
    pub fn object_url(&self, name: &str, accelerate: bool) -> String {
        let key = self.key(name);
        let encoded: Vec<String> = key.split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("https://{}/{}", self.host(accelerate), encoded.join("/"))
    }
}
