use super::{PresentationSink, PresentedMessage, Speaker};
use crate::vision::Frame;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Headless sink: everything becomes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPresentation;

impl PresentationSink for TracingPresentation {
    fn push_status(&self, text: &str) {
        info!(target = "presentation", status = %text);
    }

    fn push_message(&self, message: PresentedMessage) {
        info!(
            target = "presentation",
            speaker = ?message.speaker,
            placeholder = message.placeholder_id.as_deref().unwrap_or(""),
            has_image = message.image.is_some(),
            "{}",
            message.text
        );
    }

    fn resolve_placeholder(&self, id: &str, text: &str) {
        info!(target = "presentation", placeholder = %id, "{}", text);
    }
}

/// What a [`ChannelPresentation`] forwards.
#[derive(Debug, Clone)]
pub enum PresentationUpdate {
    Status(String),
    Message {
        speaker: Speaker,
        text: String,
        image: Option<Frame>,
        placeholder_id: Option<String>,
    },
    Resolved {
        id: String,
        text: String,
    },
}

/// Forwards updates to whoever renders them (a UI thread, a test).
#[derive(Debug, Clone)]
pub struct ChannelPresentation {
    tx: mpsc::UnboundedSender<PresentationUpdate>,
}

impl ChannelPresentation {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PresentationUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, update: PresentationUpdate) {
        if self.tx.send(update).is_err() {
            debug!(target = "presentation", "Presentation receiver dropped");
        }
    }
}

impl PresentationSink for ChannelPresentation {
    fn push_status(&self, text: &str) {
        self.send(PresentationUpdate::Status(text.to_string()));
    }

    fn push_message(&self, message: PresentedMessage) {
        self.send(PresentationUpdate::Message {
            speaker: message.speaker,
            text: message.text,
            image: message.image,
            placeholder_id: message.placeholder_id,
        });
    }

    fn resolve_placeholder(&self, id: &str, text: &str) {
        self.send(PresentationUpdate::Resolved {
            id: id.to_string(),
            text: text.to_string(),
        });
    }
}
