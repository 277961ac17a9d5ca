use super::{Transcriber, TranscribeOptions, Transcript};
use crate::{Result, VigilError};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// OpenAI-compatible `/audio/transcriptions` endpoint (SenseVoice, whisper
/// servers and the like).
#[derive(Debug, Clone)]
pub struct TranscriberConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("STT_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            model: std::env::var("STT_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "sensevoice-small".to_string()),
            api_key: std::env::var("STT_API_KEY").ok().filter(|s| !s.is_empty()),
            request_timeout_ms: std::env::var("STT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(20_000),
        }
    }
}

#[derive(Clone)]
pub struct HttpTranscriber {
    http: Client,
    cfg: TranscriberConfig,
}

impl HttpTranscriber {
    pub fn new(cfg: TranscriberConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| VigilError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, wav: Vec<u8>, opts: &TranscribeOptions) -> Result<Transcript> {
        let url = format!(
            "{}/audio/transcriptions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let part = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let mut form = Form::new()
            .part("file", part)
            .text("model", self.cfg.model.clone());
        if !opts.language.is_empty() {
            form = form.text("language", opts.language.clone());
        }

        let mut req = self.http.post(&url).multipart(form);
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(target = "stt", %status, body = %body, "Transcription rejected");
            return Err(VigilError::Collaborator(format!(
                "transcription error: status={}",
                status
            )));
        }
        let body: TranscriptionResponse = resp.json().await?;
        debug!(target = "stt", raw = %body.text, "Raw transcript");
        Ok(parse_tagged_transcript(&body.text))
    }
}

/// Split recognizer output like `<|zh|><|NEUTRAL|><|Speech|>hello` into
/// its leading tags and the clean text.
pub fn parse_tagged_transcript(raw: &str) -> Transcript {
    let mut rest = raw.trim_start();
    let mut tags = Vec::new();
    while let Some(after) = rest.strip_prefix("<|") {
        match after.find("|>") {
            Some(end) => {
                let tag = after[..end].trim();
                if !tag.is_empty() {
                    tags.push(tag.to_string());
                }
                rest = after[end + 2..].trim_start();
            }
            None => break,
        }
    }
    Transcript {
        text: rest.trim().to_string(),
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_tags() {
        let t = parse_tagged_transcript("<|zh|><|NEUTRAL|><|Speech|>我刚才在喝水吗");
        assert_eq!(t.text, "我刚才在喝水吗");
        assert_eq!(t.tags, vec!["zh", "NEUTRAL", "Speech"]);
    }

    #[test]
    fn untagged_text_passes_through() {
        let t = parse_tagged_transcript("  did I drink anything  ");
        assert_eq!(t.text, "did I drink anything");
        assert!(t.tags.is_empty());
    }

    #[test]
    fn unterminated_tag_is_left_as_text() {
        let t = parse_tagged_transcript("<|en|><|broken");
        assert_eq!(t.tags, vec!["en"]);
        assert_eq!(t.text, "<|broken");
    }
}
