//! Local CLI speech synthesis.
//!
//! Prefers Piper (needs a voice model), falls back to espeak-ng. Both write a
//! WAV into a temp file which is read back and removed; the bytes go to the
//! playback worker.
//!
//! Env overrides:
//! - PIPER_BIN, PIPER_VOICE, PIPER_VOICE_DIR
//! - ESPEAK_BIN
//! - TTS_TEMP_DIR, TTS_SAMPLE_RATE

use crate::utils::scale_wav_pcm16;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};
use vigil_core::collab::{SpeechSynthesizer, VoiceSpec};
use vigil_core::utils::gen_id;
use vigil_core::{Result, VigilError};

#[derive(Clone, Debug)]
pub struct CliSynthesizerConfig {
    pub temp_dir: PathBuf,
    pub sample_rate_hz: u32,
    pub piper_bin: Option<PathBuf>,
    pub piper_voice: Option<PathBuf>,
    pub piper_voice_dir: Option<PathBuf>,
    pub espeak_bin: Option<PathBuf>,
}

impl Default for CliSynthesizerConfig {
    fn default() -> Self {
        let temp_dir = std::env::var("TTS_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let sample_rate_hz = std::env::var("TTS_SAMPLE_RATE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(16_000);
        Self {
            temp_dir,
            sample_rate_hz,
            piper_bin: get_from_env_or_path("PIPER_BIN", "piper"),
            piper_voice: std::env::var("PIPER_VOICE").ok().map(PathBuf::from),
            piper_voice_dir: std::env::var("PIPER_VOICE_DIR").ok().map(PathBuf::from),
            espeak_bin: get_from_env_or_path("ESPEAK_BIN", "espeak-ng")
                .or_else(|| get_from_path("espeak")),
        }
    }
}

pub(crate) fn get_from_env_or_path(env_key: &str, default_bin: &str) -> Option<PathBuf> {
    if let Ok(p) = std::env::var(env_key) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Some(pb);
        }
    }
    get_from_path(default_bin)
}

pub(crate) fn get_from_path(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let p = PathBuf::from(bin);
        return if p.exists() { Some(p) } else { None };
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.exists())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Piper,
    Espeak,
}

/// [`SpeechSynthesizer`] backed by piper or espeak-ng.
pub struct CliSynthesizer {
    cfg: CliSynthesizerConfig,
}

impl CliSynthesizer {
    pub fn new(cfg: CliSynthesizerConfig) -> Self {
        Self { cfg }
    }

    /// Engine that will be used for `voice`, if any is installed.
    pub fn engine(&self, voice: &VoiceSpec) -> Option<Engine> {
        let voice = voice.voice.as_deref().unwrap_or("");
        if self.cfg.piper_bin.is_some() && resolve_piper_voice_path(&self.cfg, voice).is_some() {
            return Some(Engine::Piper);
        }
        self.cfg.espeak_bin.as_ref().map(|_| Engine::Espeak)
    }
}

#[async_trait]
impl SpeechSynthesizer for CliSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceSpec) -> Result<Vec<u8>> {
        let engine = self.engine(voice).ok_or_else(|| {
            VigilError::Collaborator("no TTS engine found (install piper or espeak-ng)".into())
        })?;
        let cfg = self.cfg.clone();
        let text = text.to_string();
        let voice = voice.clone();
        let gain = voice.volume;
        let out_wav = cfg.temp_dir.join(format!("vigil_tts_{}.wav", gen_id()));

        info!(target = "tts", ?engine, chars = text.chars().count(), "Synthesizing");
        // The engine keeps running even if this future is dropped (skip or
        // timeout), so the file is owned and removed by the blocking task.
        let joined = tokio::task::spawn_blocking(move || {
            let out = TempWav(out_wav);
            let rate = voice.rate.unwrap_or(1.0).clamp(0.5, 2.0);
            let name = voice.voice.as_deref().unwrap_or("");
            match engine {
                Engine::Piper => synth_with_piper(&cfg, name, rate, &text, out.path())?,
                Engine::Espeak => {
                    let volume = voice.volume.unwrap_or(1.0).clamp(0.5, 2.0);
                    synth_with_espeak(&cfg, name, rate, volume, &text, out.path())?
                }
            }
            std::fs::read(out.path()).map_err(VigilError::from)
        })
        .await;

        let mut wav = match joined {
            Ok(result) => result?,
            Err(e) => return Err(VigilError::Collaborator(format!("TTS task failed: {}", e))),
        };
        // espeak applies volume itself
        if engine == Engine::Piper {
            if let Some(gain) = gain.filter(|v| (*v - 1.0).abs() > f32::EPSILON) {
                scale_wav_pcm16(&mut wav, gain.clamp(0.5, 2.0));
            }
        }
        debug!(target = "tts", bytes = wav.len(), "Synthesis done");
        Ok(wav)
    }
}

/// Engine output file, removed when dropped.
struct TempWav(PathBuf);

impl TempWav {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempWav {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(target = "tts", path = %self.0.display(), "Temp WAV not removed: {}", e);
            }
        }
    }
}

fn resolve_piper_voice_path(cfg: &CliSynthesizerConfig, voice: &str) -> Option<PathBuf> {
    if let Some(v) = &cfg.piper_voice {
        return Some(v.clone());
    }
    if voice.is_empty() {
        return None;
    }
    let direct = PathBuf::from(voice);
    if direct.exists() {
        return Some(direct);
    }
    let dir = cfg.piper_voice_dir.as_ref()?;
    let candidate = dir.join(voice);
    if candidate.exists() {
        return Some(candidate);
    }
    ["onnx", "onnx.gz"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", voice, ext)))
        .find(|c| c.exists())
}

fn synth_with_piper(
    cfg: &CliSynthesizerConfig,
    voice: &str,
    rate: f32,
    text: &str,
    out_wav: &Path,
) -> Result<()> {
    let piper = cfg
        .piper_bin
        .as_ref()
        .ok_or_else(|| VigilError::Collaborator("Piper binary not found".into()))?;
    let voice_path = resolve_piper_voice_path(cfg, voice).ok_or_else(|| {
        VigilError::Collaborator("Piper voice not found; set PIPER_VOICE".into())
    })?;

    let mut cmd = Command::new(piper);
    cmd.arg("-m").arg(voice_path);
    cmd.arg("-f").arg(out_wav);
    let length_scale = (1.0f32 / rate).clamp(0.5, 2.0);
    cmd.arg("--length_scale").arg(format!("{:.2}", length_scale));
    cmd.arg("--sample_rate").arg(cfg.sample_rate_hz.to_string());
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!(target = "tts", command = ?cmd, "Running piper");
    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(VigilError::Collaborator(format!(
            "Piper failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

fn synth_with_espeak(
    cfg: &CliSynthesizerConfig,
    voice: &str,
    rate: f32,
    volume: f32,
    text: &str,
    out_wav: &Path,
) -> Result<()> {
    let espeak = cfg
        .espeak_bin
        .as_ref()
        .ok_or_else(|| VigilError::Collaborator("espeak-ng not found".into()))?;
    let mut cmd = Command::new(espeak);
    if !voice.is_empty() {
        cmd.arg("-v").arg(voice);
    }
    cmd.arg("-s").arg(espeak_wpm(rate).to_string());
    cmd.arg("-a").arg(espeak_amplitude(volume).to_string());
    cmd.arg("-w").arg(out_wav);
    cmd.arg(text);
    debug!(target = "tts", command = ?cmd, "Running espeak-ng");
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(VigilError::Collaborator(format!(
            "espeak-ng failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

fn espeak_wpm(rate: f32) -> i32 {
    (160.0 * rate).round().clamp(80.0, 450.0) as i32
}

fn espeak_amplitude(volume: f32) -> i32 {
    (100.0 * volume).round().clamp(50.0, 200.0) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_cfg() -> CliSynthesizerConfig {
        CliSynthesizerConfig {
            temp_dir: std::env::temp_dir(),
            sample_rate_hz: 16_000,
            piper_bin: None,
            piper_voice: None,
            piper_voice_dir: None,
            espeak_bin: None,
        }
    }

    #[test]
    fn espeak_arguments_are_clamped() {
        assert_eq!(espeak_wpm(1.0), 160);
        assert_eq!(espeak_wpm(10.0), 450);
        assert_eq!(espeak_amplitude(0.1), 50);
        assert_eq!(espeak_amplitude(1.5), 150);
    }

    #[test]
    fn piper_needs_a_voice_model() {
        let mut cfg = empty_cfg();
        cfg.piper_bin = Some(PathBuf::from("/usr/bin/piper"));
        cfg.espeak_bin = Some(PathBuf::from("/usr/bin/espeak-ng"));
        let synth = CliSynthesizer::new(cfg.clone());
        assert_eq!(synth.engine(&VoiceSpec::default()), Some(Engine::Espeak));

        cfg.piper_voice = Some(PathBuf::from("/voices/en.onnx"));
        let synth = CliSynthesizer::new(cfg);
        assert_eq!(synth.engine(&VoiceSpec::default()), Some(Engine::Piper));
    }

    #[tokio::test]
    async fn missing_engines_are_a_collaborator_error() {
        let synth = CliSynthesizer::new(empty_cfg());
        let err = synth
            .synthesize("hello", &VoiceSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::Collaborator(_)));
    }

    /// Fake espeak-ng: sleeps, then writes a tiny WAV to its `-w` path.
    #[cfg(unix)]
    fn fake_espeak(dir: &Path, delay: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-espeak");
        let body = format!(
            "#!/bin/sh\nout=\"\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-w\" ]; then out=\"$2\"; fi\n  shift\ndone\nsleep {delay}\nprintf 'RIFF0000WAVE' > \"$out\"\n"
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    fn temp_wavs(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("vigil_tts_"))
            .collect()
    }

    #[cfg(unix)]
    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vigil-tts-test-{}", gen_id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn espeak_output_is_read_and_removed() {
        let dir = scratch_dir();
        let mut cfg = empty_cfg();
        cfg.temp_dir = dir.clone();
        cfg.espeak_bin = Some(fake_espeak(&dir, "0"));

        let wav = CliSynthesizer::new(cfg)
            .synthesize("hello", &VoiceSpec::default())
            .await
            .unwrap();
        assert_eq!(wav, b"RIFF0000WAVE".to_vec());
        assert!(temp_wavs(&dir).is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_synthesis_still_removes_its_temp_file() {
        let dir = scratch_dir();
        let mut cfg = empty_cfg();
        cfg.temp_dir = dir.clone();
        cfg.espeak_bin = Some(fake_espeak(&dir, "1"));
        let synth = CliSynthesizer::new(cfg);

        let cut_short = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            synth.synthesize("a long answer", &VoiceSpec::default()),
        )
        .await;
        assert!(cut_short.is_err());

        // Engine finishes in the background and cleans up after itself.
        tokio::time::sleep(std::time::Duration::from_millis(1_800)).await;
        assert!(temp_wavs(&dir).is_empty(), "left behind: {:?}", temp_wavs(&dir));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
