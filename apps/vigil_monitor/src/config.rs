use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vigil_audio::{CliSynthesizerConfig, HandoffConfig, PlaybackConfig, VadConfig};
#[cfg(feature = "mic")]
use vigil_audio::MicConfig;
use vigil_core::behavior::CooldownPolicy;
use vigil_core::collab::{ChatClientConfig, StorageConfig, TranscriberConfig};
use vigil_core::vision::{DispatcherConfig, FfmpegCameraConfig, FrameSourceConfig, SchedulerConfig};
use vigil_core::{RouterConfig, TrackerConfig};

/// Everything the monitor wires together.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub camera: FfmpegCameraConfig,
    pub frames: FrameSourceConfig,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub tracker: TrackerConfig,
    pub router: RouterConfig,
    pub vision: ChatClientConfig,
    pub reply: ChatClientConfig,
    pub storage: StorageConfig,
    pub stt: TranscriberConfig,
    pub handoff: HandoffConfig,
    pub vad: VadConfig,
    #[cfg(feature = "mic")]
    pub mic: MicConfig,
    pub playback: PlaybackConfig,
    pub tts: CliSynthesizerConfig,
    pub journal_path: PathBuf,
    /// Listen to the microphone.
    pub voice_enabled: bool,
    /// Speak replies.
    pub speech_enabled: bool,
    /// Separator cadence in the conversation view.
    pub timestamp_interval: Duration,
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl Default for MonitorConfig {
    fn default() -> Self {
        // Module defaults already consider env vars
        Self {
            camera: FfmpegCameraConfig::default(),
            frames: FrameSourceConfig::default(),
            scheduler: SchedulerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            tracker: TrackerConfig::default(),
            router: RouterConfig::default(),
            vision: ChatClientConfig::vision(),
            reply: ChatClientConfig::reply(),
            storage: StorageConfig::default(),
            stt: TranscriberConfig::default(),
            handoff: HandoffConfig::default(),
            vad: VadConfig::default(),
            #[cfg(feature = "mic")]
            mic: MicConfig::default(),
            playback: PlaybackConfig::default(),
            tts: CliSynthesizerConfig::default(),
            journal_path: std::env::var("BEHAVIOR_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("behavior_log.txt")),
            voice_enabled: env_flag("VIGIL_VOICE", true),
            speech_enabled: env_flag("VIGIL_SPEECH", true),
            timestamp_interval: Duration::from_secs(60),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file (path via VIGIL_CONFIG or
    /// ./vigil.toml), overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| "vigil.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target = "vigil_monitor", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::overlay_str(&s, default.clone()) {
                Ok(cfg) => {
                    tracing::info!(target = "vigil_monitor", path = %path, "Loaded TOML config");
                    cfg
                }
                Err(e) => {
                    tracing::warn!(target = "vigil_monitor", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target = "vigil_monitor", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    pub fn overlay_str(s: &str, base: Self) -> Result<Self, toml::de::Error> {
        Ok(toml::from_str::<MonitorToml>(s)?.overlay(base))
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct MonitorToml {
    pub journal_path: Option<PathBuf>,
    pub voice_enabled: Option<bool>,
    pub speech_enabled: Option<bool>,
    pub timestamp_interval_secs: Option<u64>,
    pub camera: Option<CameraToml>,
    pub capture: Option<CaptureToml>,
    pub tracker: Option<TrackerToml>,
    pub router: Option<RouterToml>,
    pub vision: Option<ChatToml>,
    pub reply: Option<ChatToml>,
    pub storage: Option<StorageToml>,
    pub stt: Option<SttToml>,
    pub vad: Option<VadToml>,
    #[cfg(feature = "mic")]
    pub mic: Option<MicToml>,
    pub playback: Option<PlaybackToml>,
}

impl MonitorToml {
    fn overlay(self, mut base: MonitorConfig) -> MonitorConfig {
        if let Some(v) = self.journal_path {
            base.journal_path = v;
        }
        if let Some(v) = self.voice_enabled {
            base.voice_enabled = v;
        }
        if let Some(v) = self.speech_enabled {
            base.speech_enabled = v;
        }
        if let Some(v) = self.timestamp_interval_secs {
            base.timestamp_interval = Duration::from_secs(v.max(1));
        }
        if let Some(c) = self.camera {
            c.apply(&mut base.camera, &mut base.frames);
        }
        if let Some(c) = self.capture {
            c.apply(&mut base.scheduler, &mut base.dispatcher);
        }
        if let Some(t) = self.tracker {
            t.apply(&mut base.tracker);
        }
        if let Some(r) = self.router {
            r.apply(&mut base.router);
        }
        if let Some(v) = self.vision {
            v.apply(&mut base.vision);
        }
        if let Some(r) = self.reply {
            r.apply(&mut base.reply);
        }
        if let Some(s) = self.storage {
            s.apply(&mut base.storage);
        }
        if let Some(s) = self.stt {
            s.apply(&mut base.stt, &mut base.handoff);
        }
        if let Some(v) = self.vad {
            v.apply(&mut base.vad);
        }
        #[cfg(feature = "mic")]
        if let Some(m) = self.mic {
            m.apply(&mut base.mic);
        }
        if let Some(p) = self.playback {
            p.apply(&mut base.playback);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct CameraToml {
    pub program: Option<String>,
    pub input_format: Option<String>,
    pub device: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub read_interval_ms: Option<u64>,
    pub error_backoff_ms: Option<u64>,
    pub open_attempts: Option<u32>,
}
impl CameraToml {
    fn apply(self, c: &mut FfmpegCameraConfig, f: &mut FrameSourceConfig) {
        if let Some(v) = self.program {
            c.program = v;
        }
        if let Some(v) = self.input_format {
            c.input_format = v;
        }
        if let Some(v) = self.device {
            c.device = v;
        }
        if let Some(v) = self.width {
            c.width = v;
        }
        if let Some(v) = self.height {
            c.height = v;
        }
        if let Some(v) = self.fps {
            c.fps = v;
        }
        if let Some(v) = self.read_interval_ms {
            f.read_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.error_backoff_ms {
            f.error_backoff = Duration::from_millis(v);
        }
        if let Some(v) = self.open_attempts {
            f.open_attempts = v.max(1);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct CaptureToml {
    pub initial_delay_ms: Option<u64>,
    pub cycle_delay_ms: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub resume_delay_ms: Option<u64>,
    pub burst_frames: Option<usize>,
    pub burst_spacing_ms: Option<u64>,
    pub vision_timeout_ms: Option<u64>,
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
}
impl CaptureToml {
    fn apply(self, s: &mut SchedulerConfig, d: &mut DispatcherConfig) {
        if let Some(v) = self.initial_delay_ms {
            s.initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.cycle_delay_ms {
            s.rearm_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.retry_delay_ms {
            s.retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.resume_delay_ms {
            s.resume_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.burst_frames {
            d.burst_frames = v.max(1);
        }
        if let Some(v) = self.burst_spacing_ms {
            d.burst_spacing = Duration::from_millis(v);
        }
        if let Some(v) = self.vision_timeout_ms {
            d.vision_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.system_prompt {
            d.prompt.system = v;
        }
        if let Some(v) = self.user_prompt {
            d.prompt.user = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct TrackerToml {
    pub eating_threshold: Option<u64>,
    pub beverage_threshold: Option<u64>,
    pub phone_threshold: Option<u64>,
    pub sitting_minutes: Option<u64>,
    pub work_encouragement_minutes: Option<u64>,
    pub reminder_interval_minutes: Option<u64>,
    pub cooldown: Option<String>,
    pub require_current_match: Option<bool>,
}
impl TrackerToml {
    fn apply(self, t: &mut TrackerConfig) {
        if let Some(v) = self.eating_threshold {
            t.eating_threshold = v;
        }
        if let Some(v) = self.beverage_threshold {
            t.beverage_threshold = v;
        }
        if let Some(v) = self.phone_threshold {
            t.phone_threshold = v;
        }
        if let Some(v) = self.sitting_minutes {
            t.sitting_threshold = Duration::from_secs(v * 60);
        }
        if let Some(v) = self.work_encouragement_minutes {
            t.work_encouragement_after = Duration::from_secs(v * 60);
        }
        if let Some(v) = self.reminder_interval_minutes {
            t.reminder_interval = Duration::from_secs(v * 60);
        }
        if let Some(v) = self.cooldown {
            match CooldownPolicy::parse(&v) {
                Some(p) => t.cooldown = p,
                None => tracing::warn!(target = "vigil_monitor", value = %v, "Unknown cooldown policy; keeping default"),
            }
        }
        if let Some(v) = self.require_current_match {
            t.require_current_match = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RouterToml {
    pub system_prompt: Option<String>,
    pub history_cap: Option<usize>,
    pub observation_cap: Option<usize>,
    pub reply_timeout_ms: Option<u64>,
}
impl RouterToml {
    fn apply(self, r: &mut RouterConfig) {
        if let Some(v) = self.system_prompt {
            r.system_prompt = v;
        }
        if let Some(v) = self.history_cap {
            r.history_cap = v;
        }
        if let Some(v) = self.observation_cap {
            r.observation_cap = v;
        }
        if let Some(v) = self.reply_timeout_ms {
            r.reply_timeout = Duration::from_millis(v);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ChatToml {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}
impl ChatToml {
    fn apply(self, c: &mut ChatClientConfig) {
        if let Some(v) = self.base_url {
            c.base_url = v;
        }
        if let Some(v) = self.model {
            c.model = v;
        }
        if let Some(v) = self.api_key {
            if !v.is_empty() {
                c.api_key = Some(v);
            }
        }
        if let Some(v) = self.request_timeout_ms {
            c.request_timeout_ms = v;
        }
        if let Some(v) = self.temperature {
            c.temperature = v;
        }
        if let Some(v) = self.max_tokens {
            c.max_tokens = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct StorageToml {
    pub base_url: Option<String>,
    pub public_url: Option<String>,
    pub api_key: Option<String>,
    pub key_prefix: Option<String>,
    pub request_timeout_ms: Option<u64>,
}
impl StorageToml {
    fn apply(self, s: &mut StorageConfig) {
        if let Some(v) = self.base_url {
            s.base_url = v;
        }
        if let Some(v) = self.public_url {
            s.public_url = Some(v);
        }
        if let Some(v) = self.api_key {
            if !v.is_empty() {
                s.api_key = Some(v);
            }
        }
        if let Some(v) = self.key_prefix {
            s.key_prefix = v;
        }
        if let Some(v) = self.request_timeout_ms {
            s.request_timeout_ms = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SttToml {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub language: Option<String>,
    pub request_timeout_ms: Option<u64>,
}
impl SttToml {
    fn apply(self, s: &mut TranscriberConfig, h: &mut HandoffConfig) {
        if let Some(v) = self.base_url {
            s.base_url = v;
        }
        if let Some(v) = self.model {
            s.model = v;
        }
        if let Some(v) = self.api_key {
            if !v.is_empty() {
                s.api_key = Some(v);
            }
        }
        if let Some(v) = self.language {
            h.language = v;
        }
        if let Some(v) = self.request_timeout_ms {
            s.request_timeout_ms = v;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct VadToml {
    pub static_floor: Option<f32>,
    pub threshold_multiplier: Option<f32>,
    pub calibration_ms: Option<u64>,
    pub silence_ms: Option<u64>,
    pub min_speech_ms: Option<u64>,
    pub max_utterance_ms: Option<u64>,
}
impl VadToml {
    fn apply(self, v: &mut VadConfig) {
        if let Some(x) = self.static_floor {
            v.static_floor = x.max(0.0);
        }
        if let Some(x) = self.threshold_multiplier {
            if x > 0.0 {
                v.threshold_multiplier = x;
            }
        }
        if let Some(x) = self.calibration_ms {
            v.calibration = Duration::from_millis(x);
        }
        if let Some(x) = self.silence_ms {
            v.silence_timeout = Duration::from_millis(x);
        }
        if let Some(x) = self.min_speech_ms {
            v.min_speech = Duration::from_millis(x);
        }
        if let Some(x) = self.max_utterance_ms {
            v.max_utterance = Duration::from_millis(x);
        }
    }
}

#[cfg(feature = "mic")]
#[derive(Debug, Clone, Default, serde::Deserialize)]
struct MicToml {
    pub device_name: Option<String>,
    pub chunk_ms: Option<u32>,
    pub open_attempts: Option<u32>,
}
#[cfg(feature = "mic")]
impl MicToml {
    fn apply(self, m: &mut MicConfig) {
        if let Some(v) = self.device_name {
            m.device_name = Some(v);
        }
        if let Some(v) = self.chunk_ms {
            m.chunk_ms = v.max(1);
        }
        if let Some(v) = self.open_attempts {
            m.open_attempts = v.max(1);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct PlaybackToml {
    pub max_normal: Option<usize>,
    pub stale_ms: Option<u64>,
    pub voice: Option<String>,
    pub rate: Option<f32>,
    pub volume: Option<f32>,
    pub synth_timeout_ms: Option<u64>,
}
impl PlaybackToml {
    fn apply(self, p: &mut PlaybackConfig) {
        if let Some(v) = self.max_normal {
            p.max_normal = v.max(1);
        }
        if let Some(v) = self.stale_ms {
            p.stale_after = Duration::from_millis(v);
        }
        if let Some(v) = self.voice {
            p.voice.voice = Some(v);
        }
        if let Some(v) = self.rate {
            p.voice.rate = Some(v.clamp(0.5, 2.0));
        }
        if let Some(v) = self.volume {
            p.voice.volume = Some(v.clamp(0.5, 2.0));
        }
        if let Some(v) = self.synth_timeout_ms {
            p.synth_timeout = Duration::from_millis(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_only_touches_present_keys() {
        let base = MonitorConfig::default();
        let before_rearm = base.scheduler.rearm_delay;
        let cfg = MonitorConfig::overlay_str(
            r#"
            speech_enabled = false

            [capture]
            retry_delay_ms = 2500

            [tracker]
            cooldown = "shared"
            phone_threshold = 3

            [playback]
            stale_ms = 4000
            volume = 9.0
            "#,
            base,
        )
        .unwrap();

        assert!(!cfg.speech_enabled);
        assert_eq!(cfg.scheduler.retry_delay, Duration::from_millis(2500));
        assert_eq!(cfg.scheduler.rearm_delay, before_rearm);
        assert_eq!(cfg.tracker.cooldown, CooldownPolicy::Shared);
        assert_eq!(cfg.tracker.phone_threshold, 3);
        assert_eq!(cfg.playback.stale_after, Duration::from_millis(4000));
        assert_eq!(cfg.playback.voice.volume, Some(2.0));
    }

    #[test]
    fn unknown_cooldown_keeps_default() {
        let base = MonitorConfig::default();
        let default_policy = base.tracker.cooldown;
        let cfg = MonitorConfig::overlay_str("[tracker]\ncooldown = \"sometimes\"\n", base).unwrap();
        assert_eq!(cfg.tracker.cooldown, default_policy);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(MonitorConfig::overlay_str("[capture\n", MonitorConfig::default()).is_err());
    }
}
