use super::frame::{Frame, FrameSource};
use super::scheduler::{AnalysisCycle, CycleOutcome};
use crate::behavior::classify;
use crate::collab::{
    ObjectStore, PresentationSink, PresentedMessage, Speaker, VisionAnalyzer, VisionPrompt,
};
use crate::event::{AnalysisEvent, EventQueue, VisionAnalysis};
use crate::utils::now_ms;
use crate::{Result, VigilError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub burst_frames: usize,
    pub burst_spacing: Duration,
    pub upload_timeout: Duration,
    pub vision_timeout: Duration,
    pub prompt: VisionPrompt,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let ms = |key: &str, default: u64| {
            Duration::from_millis(
                std::env::var(key)
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(default),
            )
        };
        Self {
            burst_frames: std::env::var("CAPTURE_BURST_FRAMES")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(4),
            burst_spacing: ms("CAPTURE_BURST_SPACING_MS", 100),
            upload_timeout: ms("UPLOAD_TIMEOUT_MS", 15_000),
            vision_timeout: ms("VISION_TIMEOUT_MS", 60_000),
            prompt: VisionPrompt::default(),
        }
    }
}

/// Runs one capture → upload → analyze → classify round and publishes the
/// result as a vision event.
pub struct AnalysisDispatcher {
    frames: FrameSource,
    store: Arc<dyn ObjectStore>,
    vision: Arc<dyn VisionAnalyzer>,
    queue: EventQueue,
    presentation: Arc<dyn PresentationSink>,
    cfg: DispatcherConfig,
}

impl AnalysisDispatcher {
    pub fn new(
        frames: FrameSource,
        store: Arc<dyn ObjectStore>,
        vision: Arc<dyn VisionAnalyzer>,
        queue: EventQueue,
        presentation: Arc<dyn PresentationSink>,
        cfg: DispatcherConfig,
    ) -> Self {
        Self {
            frames,
            store,
            vision,
            queue,
            presentation,
            cfg,
        }
    }

    /// Upload every frame; individual failures are skipped.
    async fn upload_burst(&self, burst: &[Frame]) -> Result<Vec<String>> {
        let mut urls = Vec::with_capacity(burst.len());
        for (i, frame) in burst.iter().enumerate() {
            let upload = self
                .store
                .upload(frame.data.as_ref().clone(), frame.content_type());
            match timeout(self.cfg.upload_timeout, upload).await {
                Ok(Ok(url)) => urls.push(url),
                Ok(Err(e)) => warn!(target = "dispatch", frame = i, error = %e, "Frame upload failed"),
                Err(_) => warn!(target = "dispatch", frame = i, "Frame upload timed out"),
            }
        }
        if urls.is_empty() {
            return Err(VigilError::Collaborator("no frame could be uploaded".into()));
        }
        Ok(urls)
    }

    async fn analyze(
        &self,
        burst: Vec<Frame>,
        display_frame: Option<Frame>,
        placeholder_id: &str,
    ) -> Result<u64> {
        let urls = self.upload_burst(&burst).await?;
        debug!(target = "dispatch", uploaded = urls.len(), "Burst uploaded");

        let text = timeout(
            self.cfg.vision_timeout,
            self.vision.analyze(&urls, &self.cfg.prompt),
        )
        .await
        .map_err(|_| VigilError::Collaborator("vision analysis timed out".into()))??;

        let code = classify(&text);
        info!(target = "dispatch", code = code.number(), behavior = %code, "Vision analysis classified");

        let event = AnalysisEvent::Vision(VisionAnalysis {
            text,
            code,
            image_urls: urls,
            display_frame,
            timestamp_ms: now_ms(),
            placeholder_id: Some(placeholder_id.to_string()),
        });
        self.queue
            .publish(event)
            .ok_or_else(|| VigilError::Queue("event queue closed".into()))
    }
}

#[async_trait]
impl AnalysisCycle for AnalysisDispatcher {
    async fn run_cycle(&self) -> CycleOutcome {
        let burst = self
            .frames
            .capture_burst(self.cfg.burst_frames, self.cfg.burst_spacing)
            .await;
        if burst.is_empty() {
            warn!(target = "dispatch", "No camera frame available; cycle skipped");
            self.presentation.push_status("No camera frame available yet");
            return CycleOutcome::Abandoned;
        }
        let display_frame = self.frames.latest().or_else(|| burst.last().cloned());

        let placeholder_id = format!("img_{}", now_ms());
        self.presentation.push_message(
            PresentedMessage::new(Speaker::User, "📷 Analyzing...")
                .with_image(display_frame.clone())
                .with_placeholder(&placeholder_id),
        );

        match self.analyze(burst, display_frame, &placeholder_id).await {
            Ok(seq) => {
                debug!(target = "dispatch", seq, placeholder = %placeholder_id, "Vision event queued");
                CycleOutcome::Completed
            }
            Err(e) => {
                warn!(target = "dispatch", error = %e, "Analysis cycle abandoned");
                self.presentation
                    .push_status(&format!("Image analysis failed: {e}"));
                self.presentation
                    .resolve_placeholder(&placeholder_id, &format!("📷 Analysis failed: {e}"));
                CycleOutcome::Abandoned
            }
        }
    }
}
