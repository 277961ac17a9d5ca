//! Energy-based voice activity detection.
//!
//! [`SpeechDetector`] is a plain state machine (Calibrating → Idle →
//! Speaking) driven by PCM16 chunks; time is derived from sample counts, so
//! it behaves the same under test as on a live microphone. [`VoiceMonitor`]
//! wraps it in a task that reads chunks from the capture side and hands
//! finished utterances to the transcription side without ever blocking.

use crate::utils::{encode_wav_pcm16, frame_energy, samples_duration};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::collab::PresentationSink;
use vigil_core::utils::now_ms;
use vigil_core::SpeakingFlag;

/// One block of mono PCM16 audio from the capture side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate_hz: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate_hz: u32) -> Self {
        Self {
            samples,
            sample_rate_hz,
        }
    }

    pub fn duration(&self) -> Duration {
        samples_duration(self.samples.len(), self.sample_rate_hz)
    }
}

/// Voice Activity Detection (VAD) configuration
#[derive(Clone, Debug)]
pub struct VadConfig {
    /// Sample rate the capture side is asked to deliver.
    pub sample_rate_hz: u32,
    /// Lower bound for every threshold (mean absolute amplitude).
    pub static_floor: f32,
    /// Noise average is multiplied by this to get the speech threshold.
    pub threshold_multiplier: f32,
    /// How long the detector listens before it starts classifying.
    pub calibration: Duration,
    /// Number of trailing non-speech energies kept for the running average.
    pub noise_window: usize,
    /// Silence after the last voiced chunk that ends an utterance.
    pub silence_timeout: Duration,
    /// Utterances with less voiced audio than this are noise.
    pub min_speech: Duration,
    /// Second, stricter pass applied before emitting.
    pub validation_min: Duration,
    /// Hard cap on a single utterance.
    pub max_utterance: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        let ms = |key: &str, default: u64| {
            Duration::from_millis(
                std::env::var(key)
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(default),
            )
        };
        let static_floor = std::env::var("VAD_STATIC_FLOOR")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|v| *v >= 0.0)
            .unwrap_or(100.0);
        let threshold_multiplier = std::env::var("VAD_THRESHOLD_MULTIPLIER")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|v| *v > 0.0)
            .unwrap_or(2.5);
        let noise_window = std::env::var("VAD_NOISE_WINDOW")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .map(|v| v.max(1))
            .unwrap_or(100);
        Self {
            sample_rate_hz: 16_000,
            static_floor,
            threshold_multiplier,
            calibration: ms("VAD_CALIBRATION_MS", 3_000),
            noise_window,
            silence_timeout: ms("VAD_SILENCE_MS", 800),
            min_speech: ms("VAD_MIN_SPEECH_MS", 300),
            validation_min: ms("VAD_VALIDATION_MS", 500),
            max_utterance: ms("VAD_MAX_UTTERANCE_MS", 30_000),
        }
    }
}

/// `max(floor, mean(energies) * multiplier)`; an empty slice gives the floor.
pub fn calibrated_threshold(energies: &[f32], static_floor: f32, multiplier: f32) -> f32 {
    if energies.is_empty() {
        return static_floor;
    }
    let mean = energies.iter().sum::<f32>() / energies.len() as f32;
    static_floor.max(mean * multiplier)
}

/// A finished speech segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub samples: Vec<i16>,
    pub sample_rate_hz: u32,
    /// Stream offset of the first buffered chunk.
    pub started_at: Duration,
    /// Stream offset of the last buffered chunk, trailing silence included.
    pub ended_at: Duration,
    /// Span from the start to the end of the last voiced chunk.
    pub voiced: Duration,
    /// Wall clock when speech started.
    pub captured_at_ms: i64,
}

impl Utterance {
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_sub(self.started_at)
    }

    pub fn to_wav(&self) -> Vec<u8> {
        encode_wav_pcm16(&self.samples, self.sample_rate_hz, 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Below the minimum speech length.
    TooShort,
    /// Passed the first check but not the validation pass.
    Unvalidated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    Calibrated { threshold: f32 },
    SpeechStarted,
    Utterance(Utterance),
    Discarded {
        voiced: Duration,
        reason: DiscardReason,
    },
}

struct SpeechBuffer {
    samples: Vec<i16>,
    sample_rate_hz: u32,
    started_at: Duration,
    last_voiced_end: Duration,
    silence_since: Option<Duration>,
    captured_at_ms: i64,
}

enum Phase {
    Calibrating { energies: Vec<f32> },
    Idle,
    Speaking(SpeechBuffer),
}

/// Calibrating → Idle → Speaking → Idle.
pub struct SpeechDetector {
    cfg: VadConfig,
    phase: Phase,
    clock: Duration,
    noise: VecDeque<f32>,
}

impl SpeechDetector {
    pub fn new(cfg: VadConfig) -> Self {
        Self {
            cfg,
            phase: Phase::Calibrating {
                energies: Vec::new(),
            },
            clock: Duration::ZERO,
            noise: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.cfg
    }

    /// Stream time seen so far.
    pub fn elapsed(&self) -> Duration {
        self.clock
    }

    pub fn is_calibrating(&self) -> bool {
        matches!(self.phase, Phase::Calibrating { .. })
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.phase, Phase::Speaking(_))
    }

    /// Current dynamic threshold; `None` until calibration completes.
    pub fn threshold(&self) -> Option<f32> {
        if self.is_calibrating() {
            None
        } else {
            Some(self.dynamic_threshold())
        }
    }

    fn dynamic_threshold(&self) -> f32 {
        let (a, b) = self.noise.as_slices();
        if b.is_empty() {
            calibrated_threshold(a, self.cfg.static_floor, self.cfg.threshold_multiplier)
        } else {
            let all: Vec<f32> = self.noise.iter().copied().collect();
            calibrated_threshold(&all, self.cfg.static_floor, self.cfg.threshold_multiplier)
        }
    }

    fn push_noise(&mut self, energy: f32) {
        self.noise.push_back(energy);
        while self.noise.len() > self.cfg.noise_window {
            self.noise.pop_front();
        }
    }

    /// Feed one chunk. `suppressed` is true while the assistant's own
    /// playback is audible: the chunk is then neither classified nor folded
    /// into the noise estimate, and an open utterance treats it as silence.
    pub fn process(&mut self, chunk: &AudioChunk, suppressed: bool) -> Option<VadEvent> {
        let start = self.clock;
        self.clock += chunk.duration();
        let end = self.clock;
        let energy = frame_energy(&chunk.samples);

        match &mut self.phase {
            Phase::Calibrating { energies } => {
                if !suppressed {
                    energies.push(energy);
                }
                if end < self.cfg.calibration {
                    return None;
                }
                let energies = std::mem::take(energies);
                let threshold = calibrated_threshold(
                    &energies,
                    self.cfg.static_floor,
                    self.cfg.threshold_multiplier,
                );
                let keep = energies.len().saturating_sub(self.cfg.noise_window);
                self.noise = energies[keep..].iter().copied().collect();
                self.phase = Phase::Idle;
                Some(VadEvent::Calibrated { threshold })
            }
            Phase::Idle => {
                if suppressed {
                    return None;
                }
                if energy > self.dynamic_threshold() {
                    self.phase = Phase::Speaking(SpeechBuffer {
                        samples: chunk.samples.clone(),
                        sample_rate_hz: chunk.sample_rate_hz,
                        started_at: start,
                        last_voiced_end: end,
                        silence_since: None,
                        captured_at_ms: now_ms(),
                    });
                    Some(VadEvent::SpeechStarted)
                } else {
                    self.push_noise(energy);
                    None
                }
            }
            Phase::Speaking(_) => {
                let voiced = !suppressed && energy > self.dynamic_threshold();
                let cfg = &self.cfg;
                let Phase::Speaking(buf) = &mut self.phase else {
                    return None;
                };
                buf.samples.extend_from_slice(&chunk.samples);
                if voiced {
                    buf.last_voiced_end = end;
                    buf.silence_since = None;
                } else if buf.silence_since.is_none() {
                    buf.silence_since = Some(start);
                }
                let silent_for = buf
                    .silence_since
                    .map(|s| end.saturating_sub(s))
                    .unwrap_or_default();
                let total = end.saturating_sub(buf.started_at);
                if silent_for <= cfg.silence_timeout && total < cfg.max_utterance {
                    return None;
                }
                let Phase::Speaking(buf) = std::mem::replace(&mut self.phase, Phase::Idle) else {
                    return None;
                };
                Some(self.finalize(buf, end))
            }
        }
    }

    fn finalize(&self, buf: SpeechBuffer, ended_at: Duration) -> VadEvent {
        let voiced = buf.last_voiced_end.saturating_sub(buf.started_at);
        if voiced < self.cfg.min_speech {
            return VadEvent::Discarded {
                voiced,
                reason: DiscardReason::TooShort,
            };
        }
        if voiced < self.cfg.validation_min {
            return VadEvent::Discarded {
                voiced,
                reason: DiscardReason::Unvalidated,
            };
        }
        VadEvent::Utterance(Utterance {
            samples: buf.samples,
            sample_rate_hz: buf.sample_rate_hz,
            started_at: buf.started_at,
            ended_at,
            voiced,
            captured_at_ms: buf.captured_at_ms,
        })
    }
}

/// Long-lived loop between microphone capture and transcription.
pub struct VoiceMonitor {
    cfg: VadConfig,
    speaking: SpeakingFlag,
    presentation: Arc<dyn PresentationSink>,
}

impl VoiceMonitor {
    pub fn new(
        cfg: VadConfig,
        speaking: SpeakingFlag,
        presentation: Arc<dyn PresentationSink>,
    ) -> Self {
        Self {
            cfg,
            speaking,
            presentation,
        }
    }

    /// Runs until `cancel` fires or the chunk channel closes. Utterances are
    /// handed off with `try_send`; a full channel drops the utterance rather
    /// than stall capture.
    pub fn start(
        self,
        mut chunks: mpsc::Receiver<AudioChunk>,
        utterances: mpsc::Sender<Utterance>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut detector = SpeechDetector::new(self.cfg);
            info!(target = "vad", "Voice monitor started, calibrating");
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    c = chunks.recv() => match c {
                        Some(c) => c,
                        None => break,
                    },
                };
                let suppressed = self.speaking.is_active();
                let Some(event) = detector.process(&chunk, suppressed) else {
                    continue;
                };
                match event {
                    VadEvent::Calibrated { threshold } => {
                        info!(target = "vad", threshold, "Calibration complete");
                        self.presentation.push_status("Voice detection ready");
                    }
                    VadEvent::SpeechStarted => {
                        debug!(target = "vad", at_ms = detector.elapsed().as_millis() as u64, "Speech started");
                        self.presentation.push_status("Listening...");
                    }
                    VadEvent::Discarded { voiced, reason } => {
                        debug!(target = "vad", voiced_ms = voiced.as_millis() as u64, ?reason, "Discarded as noise");
                    }
                    VadEvent::Utterance(u) => {
                        info!(
                            target = "vad",
                            voiced_ms = u.voiced.as_millis() as u64,
                            total_ms = u.duration().as_millis() as u64,
                            "Utterance finalized"
                        );
                        if let Err(e) = utterances.try_send(u) {
                            warn!(target = "vad", "Dropping utterance: {}", e);
                        }
                    }
                }
            }
            info!(target = "vad", "Voice monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> VadConfig {
        VadConfig {
            sample_rate_hz: 16_000,
            static_floor: 100.0,
            threshold_multiplier: 2.5,
            calibration: Duration::from_millis(300),
            noise_window: 4,
            silence_timeout: Duration::from_millis(800),
            min_speech: Duration::from_millis(300),
            validation_min: Duration::from_millis(500),
            max_utterance: Duration::from_secs(30),
        }
    }

    fn chunk(level: i16) -> AudioChunk {
        // 100 ms at 16 kHz
        AudioChunk::new(vec![level; 1_600], 16_000)
    }

    #[test]
    fn threshold_never_drops_below_floor() {
        assert_eq!(calibrated_threshold(&[40.0, 50.0, 60.0], 100.0, 2.5), 125.0);
        assert_eq!(calibrated_threshold(&[10.0], 100.0, 2.5), 100.0);
        assert_eq!(calibrated_threshold(&[], 100.0, 2.5), 100.0);
    }

    #[test]
    fn noise_window_is_bounded_and_tracks_recent_levels() {
        let mut d = SpeechDetector::new(cfg());
        for _ in 0..3 {
            d.process(&chunk(20), false);
        }
        assert_eq!(d.threshold(), Some(100.0));
        // Loud-ish background below threshold shifts the average up.
        for _ in 0..4 {
            assert_eq!(d.process(&chunk(90), false), None);
        }
        assert_eq!(d.noise.len(), 4);
        assert_eq!(d.threshold(), Some(225.0));
    }

    #[test]
    fn suppressed_chunks_do_not_start_speech_or_move_the_threshold() {
        let mut d = SpeechDetector::new(cfg());
        for _ in 0..3 {
            d.process(&chunk(20), false);
        }
        let before = d.threshold();
        for _ in 0..10 {
            assert_eq!(d.process(&chunk(5_000), true), None);
        }
        assert!(!d.is_speaking());
        assert_eq!(d.threshold(), before);
    }

    #[test]
    fn unvalidated_speech_is_discarded() {
        let mut d = SpeechDetector::new(cfg());
        for _ in 0..3 {
            d.process(&chunk(20), false);
        }
        assert_eq!(d.process(&chunk(3_000), false), Some(VadEvent::SpeechStarted));
        for _ in 0..3 {
            d.process(&chunk(3_000), false);
        }
        // 400 ms voiced, then silence until the timeout.
        let mut last = None;
        for _ in 0..10 {
            if let Some(e) = d.process(&chunk(0), false) {
                last = Some(e);
                break;
            }
        }
        match last {
            Some(VadEvent::Discarded { voiced, reason }) => {
                assert_eq!(voiced, Duration::from_millis(400));
                assert_eq!(reason, DiscardReason::Unvalidated);
            }
            other => panic!("expected discard, got {other:?}"),
        }
        assert!(!d.is_speaking());
    }
}
