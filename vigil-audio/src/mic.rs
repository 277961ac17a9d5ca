//! Microphone capture using cpal.
//!
//! Linux build note: you need ALSA development headers for `cpal`.
//! On Debian/Ubuntu:
//!   sudo apt-get update && sudo apt-get install -y libasound2-dev pkg-config
//!
//! The stream is owned by one dedicated thread (cpal streams are not `Send`).
//! Callbacks convert to mono PCM16 at the requested rate and hand fixed-size
//! chunks to the voice monitor with `try_send`; a full channel drops audio
//! rather than blocking the driver.

use crate::device::{supervise, FaultFlag, RetryPolicy};
use crate::utils::{downmix_to_mono, resample_linear};
use crate::vad::AudioChunk;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::collab::PresentationSink;
use vigil_core::{Result, VigilError};

/// Configuration for microphone capture
#[derive(Clone, Debug)]
pub struct MicConfig {
    /// Rate delivered to the VAD; the device rate is converted if it differs.
    pub sample_rate_hz: u32,
    /// Chunk size handed to the VAD.
    pub chunk_ms: u32,
    /// Optional input device name substring to match
    pub device_name: Option<String>,
    pub open_attempts: u32,
    pub open_retry_delay: Duration,
}

impl Default for MicConfig {
    fn default() -> Self {
        let chunk_ms = std::env::var("MIC_CHUNK_MS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(30);
        let open_attempts = std::env::var("MIC_OPEN_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .map(|v| v.max(1))
            .unwrap_or(3);
        let retry_ms = std::env::var("MIC_OPEN_RETRY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1_000);
        Self {
            sample_rate_hz: 16_000,
            chunk_ms,
            device_name: std::env::var("MIC_DEVICE").ok(),
            open_attempts,
            open_retry_delay: Duration::from_millis(retry_ms),
        }
    }
}

pub struct MicCapture {
    cfg: MicConfig,
    presentation: Arc<dyn PresentationSink>,
}

impl MicCapture {
    pub fn new(cfg: MicConfig, presentation: Arc<dyn PresentationSink>) -> Self {
        Self { cfg, presentation }
    }

    /// Spawn the capture thread. It runs until `cancel` fires. A stream
    /// that fails while running is reopened; if the device cannot be opened
    /// after the configured attempts the loss is reported and the thread
    /// exits, leaving the rest of the system running.
    pub fn start(
        self,
        tx: mpsc::Sender<AudioChunk>,
        cancel: CancellationToken,
    ) -> Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("vigil-mic".into())
            .spawn(move || self.run(tx, cancel))
            .map_err(VigilError::Io)
    }

    fn run(self, tx: mpsc::Sender<AudioChunk>, cancel: CancellationToken) {
        let policy = RetryPolicy {
            attempts: self.cfg.open_attempts,
            delay: self.cfg.open_retry_delay,
            poll: Duration::from_millis(100),
        };
        let end = supervise(
            "Microphone",
            policy,
            self.presentation.as_ref(),
            &cancel,
            || !tx.is_closed(),
            |fault| {
                let stream = open_stream(&self.cfg, tx.clone(), fault)?;
                stream
                    .play()
                    .map_err(|e| VigilError::Device(format!("failed to start input stream: {}", e)))?;
                Ok(stream)
            },
        );
        info!(target = "vad", ?end, "Microphone capture stopped");
    }
}

fn select_device(host: &cpal::Host, needle: Option<&str>) -> Option<cpal::Device> {
    if let Some(needle) = needle {
        let needle = needle.to_lowercase();
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(dev) = devices.find(|d| {
                    d.name()
                        .map(|n| n.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                }) {
                    return Some(dev);
                }
                warn!(target = "vad", device = %needle, "No input device matched, using default");
            }
            Err(e) => warn!(target = "vad", "Failed to list input devices: {}", e),
        }
    }
    host.default_input_device()
}

/// Input sample formats ranked for capture selection: F32 > I16 > U16 > U8.
fn fmt_rank(fmt: cpal::SampleFormat) -> usize {
    match fmt {
        cpal::SampleFormat::F32 => 3,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 1,
        _ => 0,
    }
}

fn choose_config(device: &cpal::Device, wanted_rate: u32) -> Result<cpal::SupportedStreamConfig> {
    let rates = [wanted_rate, 48_000, 44_100, 32_000, 16_000];
    let ranges = device
        .supported_input_configs()
        .map_err(|e| VigilError::Device(format!("failed to query input configs: {}", e)))?;

    let mut best: Option<(cpal::SupportedStreamConfig, (usize, usize, usize))> = None;
    for range in ranges {
        let fmt = range.sample_format();
        let ch_penalty = match range.channels() {
            1 => 0,
            2 => 1,
            _ => 2,
        };
        for (rate_rank, &rate) in rates.iter().enumerate() {
            if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
                // higher fmt rank, then fewer channels, then preferred rate
                let key = (3 - fmt_rank(fmt), ch_penalty, rate_rank);
                if best.as_ref().map_or(true, |(_, k)| key < *k) {
                    best = Some((range.clone().with_sample_rate(cpal::SampleRate(rate)), key));
                }
                break;
            }
        }
    }
    match best {
        Some((cfg, _)) => Ok(cfg),
        None => device
            .default_input_config()
            .map_err(|e| VigilError::Device(format!("no usable input config: {}", e))),
    }
}

/// Turns raw device callbacks into fixed-size mono chunks at the target rate.
struct Chunker {
    tx: mpsc::Sender<AudioChunk>,
    device_rate: u32,
    channels: u16,
    target_rate: u32,
    chunk_samples: usize,
    acc: Vec<i16>,
    dropped: u64,
}

impl Chunker {
    fn push(&mut self, interleaved: &[i16]) {
        let mono = downmix_to_mono(interleaved, self.channels);
        let mono = resample_linear(&mono, self.device_rate, self.target_rate);
        self.acc.extend_from_slice(&mono);
        while self.acc.len() >= self.chunk_samples {
            let samples: Vec<i16> = self.acc.drain(..self.chunk_samples).collect();
            if self
                .tx
                .try_send(AudioChunk::new(samples, self.target_rate))
                .is_err()
            {
                self.dropped += 1;
                if self.dropped % 100 == 1 {
                    debug!(target = "vad", dropped = self.dropped, "Audio chunk dropped");
                }
            }
        }
    }
}

fn open_stream(
    cfg: &MicConfig,
    tx: mpsc::Sender<AudioChunk>,
    fault: FaultFlag,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = select_device(&host, cfg.device_name.as_deref())
        .ok_or_else(|| VigilError::Device("no input device available".into()))?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".into());
    let chosen = choose_config(&device, cfg.sample_rate_hz)?;
    let device_rate = chosen.sample_rate().0;
    let channels = chosen.channels();
    info!(
        target = "vad",
        device = %device_name,
        rate = device_rate,
        channels,
        format = ?chosen.sample_format(),
        "Microphone configured"
    );

    let mut chunker = Chunker {
        tx,
        device_rate,
        channels,
        target_rate: cfg.sample_rate_hz,
        chunk_samples: (cfg.sample_rate_hz as usize * cfg.chunk_ms as usize / 1000).max(1),
        acc: Vec::new(),
        dropped: 0,
    };
    let stream_config: cpal::StreamConfig = chosen.config();
    let err_fn = move |err: cpal::StreamError| {
        error!(target = "vad", "Input stream error: {}", err);
        fault.raise();
    };

    let stream = match chosen.sample_format() {
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &_| chunker.push(data),
            err_fn,
            None,
        ),
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &_| {
                let converted: Vec<i16> = data.iter().map(|&s| f32_to_i16(s)).collect();
                chunker.push(&converted)
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &_| {
                let converted: Vec<i16> = data.iter().map(|&s| u16_to_i16(s)).collect();
                chunker.push(&converted)
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U8 => device.build_input_stream(
            &stream_config,
            move |data: &[u8], _: &_| {
                let converted: Vec<i16> = data.iter().map(|&s| u8_to_i16(s)).collect();
                chunker.push(&converted)
            },
            err_fn,
            None,
        ),
        other => {
            return Err(VigilError::Device(format!(
                "unsupported sample format: {:?}",
                other
            )))
        }
    };
    stream.map_err(|e| VigilError::Device(format!("failed to build input stream: {}", e)))
}

#[inline]
fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[inline]
fn u16_to_i16(s: u16) -> i16 {
    (s as i32 - 32768) as i16
}

#[inline]
fn u8_to_i16(s: u8) -> i16 {
    (s as i16 - 128) << 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_formats_are_recentred() {
        assert_eq!(u16_to_i16(32768), 0);
        assert_eq!(u16_to_i16(0), i16::MIN);
        assert_eq!(u8_to_i16(128), 0);
        assert_eq!(f32_to_i16(2.0), i16::MAX);
    }

    #[test]
    fn chunker_emits_fixed_size_mono_chunks() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut c = Chunker {
            tx,
            device_rate: 16_000,
            channels: 2,
            target_rate: 16_000,
            chunk_samples: 4,
            acc: Vec::new(),
            dropped: 0,
        };
        c.push(&[10, 30, 10, 30, 10, 30]);
        assert!(rx.try_recv().is_err());
        c.push(&[0, 0, 0, 0]);
        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.samples, vec![20, 20, 20, 0]);
        assert_eq!(c.acc, vec![0]);
    }
}
