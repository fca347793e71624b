//! HTTP transport used by the remote backends / 远程存储使用的HTTP传输层

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
pub use reqwest::Method;

/// A fully built request / 完整构建的请求
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Insert or replace a header (case-insensitive name) / 设置请求头
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            existing.1 = value;
        } else {
            self.headers.push((name, value));
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

/// A buffered response / 已读取完毕的响应
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    /// Header names are lower-cased / 响应头名称统一小写
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// Turn a non-success status into an error / 非成功状态码转换为错误
    pub fn error_for_status(self, what: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            let body = self.text();
            let body = body.trim();
            Err(anyhow!(
                "{} failed with HTTP {} {}{}",
                what,
                self.status,
                self.reason,
                if body.is_empty() { String::new() } else { format!(": {}", truncate(body, 512)) }
            ))
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Sends one request / 发送单个请求
///
/// An `Err` means the request never produced a response (connection reset,
/// TLS failure, timeout) and is retried like a transient HTTP status.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// reqwest backed transport / 基于reqwest的传输实现
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() || request.method == Method::PUT || request.method == Method::POST {
            builder = builder.body(request.body.clone());
        }

        let resp = builder.send().await
            .map_err(|e| anyhow!("{} request failed: {}", request.method, e))?;

        let status = resp.status();
        let mut headers = HashMap::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_lowercase(), v.to_string());
            }
        }
        let body = resp.bytes().await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers_replace_case_insensitive() {
        let req = HttpRequest::new(Method::PUT, "https://example.com/a")
            .header("Content-Type", "text/plain")
            .header("content-type", "application/octet-stream");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.get_header("CONTENT-TYPE"), Some("application/octet-stream"));
    }

    #[test]
    fn test_error_for_status() {
        let ok = HttpResponse::new(201).error_for_status("PUT");
        assert!(ok.is_ok());

        let err = HttpResponse::new(404)
            .with_reason("Not Found")
            .with_body("missing")
            .error_for_status("GET a.csv")
            .unwrap_err();
        assert_eq!(err.to_string(), "GET a.csv failed with HTTP 404 Not Found: missing");
    }

    #[test]
    fn test_response_header_lookup() {
        let resp = HttpResponse::new(200).with_header("ETag", "\"abc\"");
        assert_eq!(resp.header("etag"), Some("\"abc\""));
        assert_eq!(resp.header("ETAG"), Some("\"abc\""));
    }
}
