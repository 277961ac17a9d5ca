//! Vigil audio: hearing and speaking.
//!
//! - `vad`: energy-based speech detection and the voice monitor loop
//! - `mic` (feature `mic`): cpal microphone capture
//! - `device`: reopen-on-fault supervision for capture threads
//! - `stt`: hands utterances to the transcriber and queues voice events
//! - `tts`: piper / espeak-ng synthesis
//! - `playback`: priority playback queue, single worker, CLI player

pub mod device;
#[cfg(feature = "mic")]
pub mod mic;
pub mod playback;
pub mod stt;
pub mod tts;
pub mod utils;
pub mod vad;

pub use device::{supervise, FaultFlag, RetryPolicy, SessionEnd};
#[cfg(feature = "mic")]
pub use mic::{MicCapture, MicConfig};
pub use playback::{
    AudioSink, CliPlayer, PlaybackConfig, PlaybackQueue, PlaybackRequest, PlaybackScheduler,
    PlaybackStats,
};
pub use stt::{HandoffConfig, TranscriptionHandoff};
pub use tts::{CliSynthesizer, CliSynthesizerConfig, Engine};
pub use vad::{
    calibrated_threshold, AudioChunk, DiscardReason, SpeechDetector, Utterance, VadConfig,
    VadEvent, VoiceMonitor,
};
