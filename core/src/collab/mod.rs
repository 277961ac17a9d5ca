//! Contracts for the external services the core leans on.
//!
//! Every trait here is an opaque, possibly slow call. Callers own the
//! timeout and the failure policy; implementations just report what went
//! wrong through [`crate::VigilError::Collaborator`] or `Http`.

pub mod llm;
pub mod presentation;
pub mod storage;
pub mod transcribe;

use crate::context::ChatMessage;
use crate::vision::Frame;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use llm::{ChatClient, ChatClientConfig};
pub use presentation::{ChannelPresentation, PresentationUpdate, TracingPresentation};
pub use storage::{HttpObjectStore, StorageConfig};
pub use transcribe::{parse_tagged_transcript, HttpTranscriber, TranscriberConfig};

/// Uploads a blob and hands back a URL the vision service can fetch.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

/// Prompt pair sent along with the frame burst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionPrompt {
    pub system: String,
    pub user: String,
}

impl Default for VisionPrompt {
    fn default() -> Self {
        Self {
            system: "Observe in detail what this person is doing. You must decide which of \
                     these applies: 1. focused work, 2. eating, 3. drinking water, \
                     4. drinking a beverage, 5. using the phone, 6. sleeping, 7. other. \
                     Use facial expression, posture, hand movement and surroundings, and \
                     state the numbered verdict explicitly."
                .to_string(),
            user: "What is this person doing? Choose one of: 1. focused work, 2. eating, \
                   3. drinking water, 4. drinking a beverage, 5. using the phone, \
                   6. sleeping, 7. other. Describe what you see and give the verdict."
                .to_string(),
        }
    }
}

/// Turns a burst of frame URLs into free-form analysis text.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(&self, image_urls: &[String], prompt: &VisionPrompt) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TranscribeOptions {
    /// Language hint such as "auto", "zh", "en".
    pub language: String,
}

/// Clean transcript text plus any inline tags the recognizer emitted
/// (language, emotion, event).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>, opts: &TranscribeOptions) -> Result<Transcript>;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VoiceSpec {
    pub voice: Option<String>,
    /// 0.5–2.0, 1.0 is normal speed.
    pub rate: Option<f32>,
    /// 0.5–2.0 gain.
    pub volume: Option<f32>,
}

/// Text to audio bytes (WAV).
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceSpec) -> Result<Vec<u8>>;
}

/// Produces the assistant's next turn from the running conversation.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate_reply(&self, history: &[ChatMessage]) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
    System,
}

/// One entry for the presentation surface.
#[derive(Debug, Clone)]
pub struct PresentedMessage {
    pub speaker: Speaker,
    pub text: String,
    pub image: Option<Frame>,
    pub placeholder_id: Option<String>,
}

impl PresentedMessage {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            image: None,
            placeholder_id: None,
        }
    }

    pub fn with_image(mut self, image: Option<Frame>) -> Self {
        self.image = image;
        self
    }

    pub fn with_placeholder(mut self, id: impl Into<String>) -> Self {
        self.placeholder_id = Some(id.into());
        self
    }
}

/// Where status lines and conversation entries end up. Calls must not
/// block: capture threads use this too.
pub trait PresentationSink: Send + Sync {
    fn push_status(&self, text: &str);
    fn push_message(&self, message: PresentedMessage);
    fn resolve_placeholder(&self, id: &str, text: &str);
}
