use super::{ReplyGenerator, VisionAnalyzer, VisionPrompt};
use crate::context::ChatMessage;
use crate::{Result, VigilError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

/// Configuration for one OpenAI-compatible chat endpoint, loaded from
/// `<PREFIX>_BASE_URL`, `<PREFIX>_MODEL`, `<PREFIX>_API_KEY`,
/// `<PREFIX>_TIMEOUT_MS` and `<PREFIX>_TEMPERATURE`.
#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatClientConfig {
    fn from_env(prefix: &str, base_url: &str, model: &str, max_tokens: u32) -> Self {
        let var = |name: &str| {
            std::env::var(format!("{prefix}_{name}"))
                .ok()
                .filter(|s| !s.is_empty())
        };
        Self {
            base_url: var("BASE_URL").unwrap_or_else(|| base_url.to_string()),
            model: var("MODEL").unwrap_or_else(|| model.to_string()),
            api_key: var("API_KEY"),
            request_timeout_ms: var("TIMEOUT_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30_000),
            temperature: var("TEMPERATURE")
                .and_then(|v| v.parse::<f32>().ok())
                .unwrap_or(0.7),
            max_tokens,
        }
    }

    /// Vision-language endpoint (`VISION_*`).
    pub fn vision() -> Self {
        Self::from_env(
            "VISION",
            "https://dashscope.aliyuncs.com/compatible-mode/v1",
            "qwen-vl-max",
            1024,
        )
    }

    /// Reply generation endpoint (`REPLY_*`).
    pub fn reply() -> Self {
        Self::from_env("REPLY", "https://api.deepseek.com/v1", "deepseek-chat", 256)
    }
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self::reply()
    }
}

/// Chat Completions client used for both the vision analysis call and the
/// reply generator.
#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    cfg: ChatClientConfig,
}

impl ChatClient {
    pub fn new(cfg: ChatClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| VigilError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &ChatClientConfig {
        &self.cfg
    }

    async fn complete(&self, messages: Value) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        debug!(target = "llm_client", model = %self.cfg.model, "POST {}", url);

        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }

        let body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "max_tokens": self.cfg.max_tokens,
            "temperature": self.cfg.temperature,
        });

        let resp = req.json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(target = "llm_client", %status, body = %text, "Chat Completions error");
            return Err(VigilError::Collaborator(format!(
                "chat completions error: status={} body={}",
                status, text
            )));
        }

        let val: Value = resp.json().await?;
        extract_text_from_chat_completions(&val).ok_or_else(|| {
            VigilError::Collaborator("missing choices[0].message.content".into())
        })
    }
}

#[async_trait]
impl ReplyGenerator for ChatClient {
    async fn generate_reply(&self, history: &[ChatMessage]) -> Result<String> {
        let messages = serde_json::to_value(history)?;
        self.complete(messages).await
    }
}

#[async_trait]
impl VisionAnalyzer for ChatClient {
    async fn analyze(&self, image_urls: &[String], prompt: &VisionPrompt) -> Result<String> {
        if image_urls.is_empty() {
            return Err(VigilError::Collaborator("no frames to analyze".into()));
        }
        self.complete(vision_messages(image_urls, prompt)).await
    }
}

/// Frames go out as one `video` part so the model sees them as a sequence.
pub fn vision_messages(image_urls: &[String], prompt: &VisionPrompt) -> Value {
    json!([
        {
            "role": "system",
            "content": [{ "type": "text", "text": prompt.system }],
        },
        {
            "role": "user",
            "content": [
                { "type": "video", "video": image_urls },
                { "type": "text", "text": prompt.user },
            ],
        },
    ])
}

fn extract_text_from_chat_completions(v: &Value) -> Option<String> {
    let content = v.get("choices")?.get(0)?.get("message")?.get("content")?;
    if let Some(s) = content.as_str() {
        return Some(s.to_string());
    }
    // Some vision endpoints answer with a list of typed parts.
    let parts = content.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vision_payload_lists_every_frame_in_one_video_part() {
        let urls = vec!["https://x/a.jpg".to_string(), "https://x/b.jpg".to_string()];
        let msgs = vision_messages(&urls, &VisionPrompt::default());
        let video = &msgs[1]["content"][0];
        assert_eq!(video["type"], "video");
        assert_eq!(video["video"].as_array().map(|a| a.len()), Some(2));
        assert_eq!(msgs[0]["role"], "system");
    }

    #[test]
    fn extracts_string_or_part_content() {
        let plain = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(extract_text_from_chat_completions(&plain).as_deref(), Some("hi"));

        let parts = json!({"choices": [{"message": {"content": [{"text": "a"}, {"text": "b"}]}}]});
        assert_eq!(extract_text_from_chat_completions(&parts).as_deref(), Some("ab"));

        assert!(extract_text_from_chat_completions(&json!({"choices": []})).is_none());
    }
}
