//! Reply output seam between the router and the playback scheduler.
//!
//! The router only knows how to ask for speech; the audio crate decides how
//! (and whether) it becomes sound. The shared [`SpeakingFlag`] is how the
//! voice monitor learns that the assistant itself is talking.

use crate::event::Priority;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Sink for reply text that should be spoken.
pub trait SpeechOutput: Send + Sync {
    /// Queue `text` for playback. Priority 1 purges whatever is queued.
    fn speak(&self, text: &str, priority: Priority);

    /// Ask the active playback (if any) to stop. Best effort.
    fn skip(&self);
}

/// Active-playback flag shared by the playback worker (writer) and the voice
/// monitor (reader).
#[derive(Clone, Debug, Default)]
pub struct SpeakingFlag(Arc<AtomicBool>);

impl SpeakingFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Speech output that drops everything. Handy when audio output is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct MutedSpeech;

impl SpeechOutput for MutedSpeech {
    fn speak(&self, text: &str, priority: Priority) {
        tracing::debug!(target = "playback", priority = priority.as_u8(), text = %text, "Speech muted");
    }

    fn skip(&self) {}
}
