//! Utterance → transcript → voice event.
//!
//! Each finished utterance gets its own short-lived task so a slow
//! recognizer never holds up the voice monitor or the next utterance.

use crate::vad::Utterance;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::collab::{PresentationSink, TranscribeOptions, Transcriber};
use vigil_core::event::VoiceInput;
use vigil_core::utils::truncate_chars;
use vigil_core::{AnalysisEvent, EventQueue, Result, SpeechOutput, VigilError};

#[derive(Clone, Debug)]
pub struct HandoffConfig {
    pub language: String,
    pub timeout: Duration,
    /// Transcripts with fewer characters than this are noise.
    pub min_chars: usize,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        let timeout_ms = std::env::var("STT_HANDOFF_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30_000);
        Self {
            language: std::env::var("STT_LANGUAGE").unwrap_or_else(|_| "auto".to_string()),
            timeout: Duration::from_millis(timeout_ms),
            min_chars: 2,
        }
    }
}

pub struct TranscriptionHandoff {
    transcriber: Arc<dyn Transcriber>,
    queue: EventQueue,
    speech: Arc<dyn SpeechOutput>,
    presentation: Arc<dyn PresentationSink>,
    cfg: HandoffConfig,
}

impl TranscriptionHandoff {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        queue: EventQueue,
        speech: Arc<dyn SpeechOutput>,
        presentation: Arc<dyn PresentationSink>,
        cfg: HandoffConfig,
    ) -> Self {
        Self {
            transcriber,
            queue,
            speech,
            presentation,
            cfg,
        }
    }

    /// Consume utterances until `cancel` fires or the channel closes.
    pub fn start(
        self,
        mut utterances: mpsc::Receiver<Utterance>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::new(self);
        tokio::spawn(async move {
            info!(target = "stt", "Transcription hand-off started");
            loop {
                let utterance = tokio::select! {
                    _ = cancel.cancelled() => break,
                    u = utterances.recv() => match u {
                        Some(u) => u,
                        None => break,
                    },
                };
                let this = Arc::clone(&this);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        r = this.handle(utterance) => {
                            if let Err(e) = r {
                                warn!(target = "stt", "Transcription failed: {}", e);
                                this.presentation
                                    .push_status(&format!("Speech recognition failed: {}", e));
                            }
                        }
                    }
                });
            }
            info!(target = "stt", "Transcription hand-off stopped");
        })
    }

    /// Transcribe one utterance and queue it as a voice event. `Ok(None)`
    /// means the transcript was too short to be speech.
    pub async fn handle(&self, utterance: Utterance) -> Result<Option<u64>> {
        self.presentation.push_status("Recognizing speech...");
        let wav = utterance.to_wav();
        debug!(
            target = "stt",
            bytes = wav.len(),
            voiced_ms = utterance.voiced.as_millis() as u64,
            "Sending utterance"
        );
        let opts = TranscribeOptions {
            language: self.cfg.language.clone(),
        };
        let transcript = timeout(self.cfg.timeout, self.transcriber.transcribe(wav, &opts))
            .await
            .map_err(|_| VigilError::Collaborator("transcription timed out".into()))??;

        let text = transcript.text.trim();
        if text.chars().count() < self.cfg.min_chars {
            debug!(target = "stt", text = %text, "Transcript too short, ignoring");
            self.presentation.push_status("No speech recognized");
            return Ok(None);
        }

        info!(target = "stt", text = %truncate_chars(text, 80), tags = ?transcript.tags, "Recognized");
        self.speech.skip();
        let seq = self
            .queue
            .publish(AnalysisEvent::Voice(VoiceInput {
                text: text.to_string(),
                tags: transcript.tags.clone(),
                timestamp_ms: utterance.captured_at_ms,
                placeholder_id: None,
            }))
            .ok_or_else(|| VigilError::Queue("event queue closed".into()))?;
        Ok(Some(seq))
    }
}
