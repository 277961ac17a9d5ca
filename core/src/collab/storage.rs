use super::ObjectStore;
use crate::utils::{gen_id, now_ms};
use crate::{Result, VigilError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Object store reachable with a plain HTTP PUT (S3-style bucket with a
/// presigned or public-write prefix, MinIO, a static file server).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Bucket/prefix URL that objects are PUT under.
    pub base_url: String,
    /// URL prefix handed to consumers; defaults to `base_url`.
    pub public_url: Option<String>,
    pub api_key: Option<String>,
    pub key_prefix: String,
    pub request_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("STORAGE_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:9000/vigil".to_string()),
            public_url: std::env::var("STORAGE_PUBLIC_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            api_key: std::env::var("STORAGE_API_KEY").ok().filter(|s| !s.is_empty()),
            key_prefix: std::env::var("STORAGE_KEY_PREFIX")
                .unwrap_or_else(|_| "frames/".to_string()),
            request_timeout_ms: std::env::var("STORAGE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(15_000),
        }
    }
}

#[derive(Clone)]
pub struct HttpObjectStore {
    http: Client,
    cfg: StorageConfig,
}

impl HttpObjectStore {
    pub fn new(cfg: StorageConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| VigilError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    fn object_key(&self, content_type: &str) -> String {
        format!(
            "{}{}_{}.{}",
            self.cfg.key_prefix,
            now_ms(),
            gen_id(),
            extension_for(content_type)
        )
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "audio/wav" | "audio/x-wav" => "wav",
        _ => "bin",
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let key = self.object_key(content_type);
        let put_url = format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), key);
        let size = bytes.len();

        let mut req = self
            .http
            .put(&put_url)
            .header("content-type", content_type)
            .body(bytes);
        if let Some(token) = &self.cfg.api_key {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            warn!(target = "storage", %status, key = %key, "Upload rejected");
            return Err(VigilError::Collaborator(format!(
                "upload of {} failed: status={}",
                key, status
            )));
        }

        let public = self
            .cfg
            .public_url
            .as_deref()
            .unwrap_or(&self.cfg.base_url)
            .trim_end_matches('/');
        let url = format!("{}/{}", public, key);
        debug!(target = "storage", size, url = %url, "Uploaded object");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_prefix_and_extension() {
        let store = HttpObjectStore::new(StorageConfig {
            base_url: "http://localhost:9000/b".into(),
            public_url: None,
            api_key: None,
            key_prefix: "frames/".into(),
            request_timeout_ms: 1000,
        })
        .unwrap();
        let key = store.object_key("image/jpeg");
        assert!(key.starts_with("frames/"));
        assert!(key.ends_with(".jpg"));
        assert_ne!(key, store.object_key("image/jpeg"));
    }
}
