// Vigil Core Library
// Event coordination runtime for the desk monitoring assistant

pub mod behavior;
pub mod collab;
pub mod context;
pub mod event;
pub mod journal;
pub mod router;
pub mod speech;
pub mod telemetry;
pub mod utils;
pub mod vision;

// Export core types
pub use behavior::{BehaviorCode, BehaviorTracker, Instruction, TrackerConfig, TrackerState};
pub use event::{AnalysisEvent, EventKind, EventQueue, Priority, QueuedEvent};
pub use router::{EventRouter, RouterConfig, RouterSnapshot};
pub use speech::{SpeakingFlag, SpeechOutput};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl VigilError {
    /// Everything except a bad configuration is retried or skipped by the
    /// owning loop.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, VigilError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(VigilError::Device("camera busy".into()).is_recoverable());
        assert!(VigilError::Collaborator("timeout".into()).is_recoverable());
        assert!(VigilError::from(std::io::Error::other("disk")).is_recoverable());
        assert!(!VigilError::Config("bad url".into()).is_recoverable());
    }
}
