//! Camera capture with always-latest semantics.
//!
//! One std thread owns the [`CameraDevice`] and overwrites a
//! `tokio::sync::watch` slot on every read. Readers clone whatever is in the
//! slot and never wait for the camera.

use crate::collab::PresentationSink;
use crate::utils::now_ms;
use crate::{Result, VigilError};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A JPEG-encoded capture. Cloning shares the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
            captured_at_ms: now_ms(),
        }
    }

    pub fn content_type(&self) -> &'static str {
        "image/jpeg"
    }
}

/// Blocking camera handle, owned by exactly one capture thread.
pub trait CameraDevice: Send + 'static {
    /// Opening an already open device is a no-op.
    fn open(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;
    fn read_frame(&mut self) -> Result<Frame>;
    fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct FrameSourceConfig {
    /// Pause between successful reads (~30/s).
    pub read_interval: Duration,
    /// Pause after a failed read.
    pub error_backoff: Duration,
    pub open_attempts: u32,
    pub open_retry_delay: Duration,
}

impl Default for FrameSourceConfig {
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
            read_interval: ms("CAMERA_READ_INTERVAL_MS", 30),
            error_backoff: ms("CAMERA_ERROR_BACKOFF_MS", 1_000),
            open_attempts: std::env::var("CAMERA_OPEN_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(3),
            open_retry_delay: ms("CAMERA_OPEN_RETRY_MS", 1_000),
        }
    }
}

/// Read side of the capture loop. Cheap to clone.
#[derive(Clone)]
pub struct FrameSource {
    latest: watch::Receiver<Option<Frame>>,
}

impl FrameSource {
    /// Start the capture thread. The thread exits when `cancel` fires or
    /// when the device cannot be opened after the configured attempts.
    pub fn spawn<C: CameraDevice>(
        camera: C,
        cfg: FrameSourceConfig,
        status: Arc<dyn PresentationSink>,
        cancel: CancellationToken,
    ) -> Result<(Self, thread::JoinHandle<()>)> {
        let (tx, rx) = watch::channel(None);
        let handle = thread::Builder::new()
            .name("frame-capture".into())
            .spawn(move || capture_loop(camera, cfg, tx, status, cancel))?;
        Ok((Self { latest: rx }, handle))
    }

    /// Most recent frame, or `None` before the first capture. Never blocks.
    pub fn latest(&self) -> Option<Frame> {
        self.latest.borrow().clone()
    }

    /// Sample the latest frame `count` times, `spacing` apart. Slots with no
    /// frame yet are skipped; a slow camera yields repeats.
    pub async fn capture_burst(&self, count: usize, spacing: Duration) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(count);
        for i in 0..count {
            if let Some(frame) = self.latest() {
                frames.push(frame);
            }
            if i + 1 < count {
                tokio::time::sleep(spacing).await;
            }
        }
        frames
    }
}

fn open_with_retries<C: CameraDevice>(
    camera: &mut C,
    cfg: &FrameSourceConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let attempts = cfg.open_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(VigilError::Device("capture cancelled before open".into()));
        }
        match camera.open() {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(target = "frames", attempt, attempts, error = %e, "Camera open failed");
                last_err = Some(e);
                if attempt < attempts {
                    thread::sleep(cfg.open_retry_delay);
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| VigilError::Device("camera open failed".into())))
}

fn capture_loop<C: CameraDevice>(
    mut camera: C,
    cfg: FrameSourceConfig,
    tx: watch::Sender<Option<Frame>>,
    status: Arc<dyn PresentationSink>,
    cancel: CancellationToken,
) {
    if let Err(e) = open_with_retries(&mut camera, &cfg, &cancel) {
        error!(target = "frames", error = %e, "Camera unavailable; capture disabled");
        status.push_status(&format!("Camera unavailable: {e}"));
        return;
    }
    info!(target = "frames", "Capture loop started");

    let mut failing = false;
    while !cancel.is_cancelled() {
        match camera.read_frame() {
            Ok(frame) => {
                if failing {
                    info!(target = "frames", "Camera recovered");
                    failing = false;
                }
                tx.send_replace(Some(frame));
                thread::sleep(cfg.read_interval);
            }
            Err(e) => {
                warn!(target = "frames", error = %e, "Frame read failed");
                if !failing {
                    status.push_status(&format!("Camera read error: {e}"));
                    failing = true;
                }
                thread::sleep(cfg.error_backoff);
                if !camera.is_open() {
                    if let Err(e) = camera.open() {
                        debug!(target = "frames", error = %e, "Camera reopen failed");
                    }
                }
            }
        }
    }

    camera.close();
    info!(target = "frames", "Capture loop stopped");
}

#[derive(Debug, Clone)]
pub struct FfmpegCameraConfig {
    pub program: String,
    /// ffmpeg input format: v4l2, avfoundation, dshow.
    pub input_format: String,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for FfmpegCameraConfig {
    fn default() -> Self {
        let default_format = if cfg!(target_os = "macos") {
            "avfoundation"
        } else if cfg!(target_os = "windows") {
            "dshow"
        } else {
            "v4l2"
        };
        let default_device = if cfg!(target_os = "macos") {
            "0"
        } else if cfg!(target_os = "windows") {
            "video=Integrated Camera"
        } else {
            "/dev/video0"
        };
        let num = |key: &str, default: u32| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(default)
        };
        Self {
            program: std::env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".into()),
            input_format: std::env::var("CAMERA_INPUT_FORMAT")
                .unwrap_or_else(|_| default_format.into()),
            device: std::env::var("CAMERA_DEVICE").unwrap_or_else(|_| default_device.into()),
            width: num("CAMERA_WIDTH", 640),
            height: num("CAMERA_HEIGHT", 480),
            fps: num("CAMERA_FPS", 30),
        }
    }
}

const MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;

/// Camera backed by a long-lived ffmpeg process writing MJPEG to stdout.
pub struct FfmpegCamera {
    cfg: FfmpegCameraConfig,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    pending: Vec<u8>,
}

impl FfmpegCamera {
    pub fn new(cfg: FfmpegCameraConfig) -> Self {
        Self {
            cfg,
            child: None,
            stdout: None,
            pending: Vec::new(),
        }
    }
}

impl CameraDevice for FfmpegCamera {
    fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let size = format!("{}x{}", self.cfg.width, self.cfg.height);
        let fps = self.cfg.fps.to_string();
        let mut child = Command::new(&self.cfg.program)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", &self.cfg.input_format])
            .args(["-framerate", &fps, "-video_size", &size])
            .args(["-i", &self.cfg.device])
            .args(["-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "5", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| VigilError::Device(format!("spawn {}: {e}", self.cfg.program)))?;
        self.stdout = child.stdout.take();
        self.child = Some(child);
        self.pending.clear();
        info!(target = "frames", device = %self.cfg.device, size = %size, "Camera opened");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.child.is_some()
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let mut chunk = [0u8; 64 * 1024];
        loop {
            if let Some(jpeg) = take_jpeg(&mut self.pending) {
                return Ok(Frame::new(jpeg, self.cfg.width, self.cfg.height));
            }
            let stdout = self
                .stdout
                .as_mut()
                .ok_or_else(|| VigilError::Device("camera not open".into()))?;
            let n = stdout.read(&mut chunk)?;
            if n == 0 {
                self.close();
                return Err(VigilError::Device("camera stream ended".into()));
            }
            self.pending.extend_from_slice(&chunk[..n]);
            if self.pending.len() > MAX_PENDING_BYTES {
                warn!(target = "frames", "Dropping unterminated MJPEG data");
                self.pending.clear();
            }
        }
    }

    fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.pending.clear();
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pull the first complete JPEG (SOI `FF D8` .. EOI `FF D9`) out of `buf`.
/// Bytes before the SOI are discarded.
pub fn take_jpeg(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let Some(start) = buf.windows(2).position(|w| w == [0xFF, 0xD8]) else {
        // Keep the last byte in case it is the first half of an SOI.
        let keep_from = buf.len().saturating_sub(1);
        buf.drain(..keep_from);
        return None;
    };
    if start > 0 {
        buf.drain(..start);
    }
    let end = buf[2..].windows(2).position(|w| w == [0xFF, 0xD9])? + 2;
    let jpeg: Vec<u8> = buf.drain(..end + 2).collect();
    Some(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ChannelPresentation, PresentationUpdate};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Fails `open_failures` opens and `read_failures` reads, then yields
    /// frames whose single byte is the read number.
    struct ScriptedCamera {
        open_failures: usize,
        read_failures: usize,
        reads: Arc<AtomicUsize>,
        open: bool,
    }

    impl ScriptedCamera {
        fn new(open_failures: usize, read_failures: usize) -> (Self, Arc<AtomicUsize>) {
            let reads = Arc::new(AtomicUsize::new(0));
            let cam = Self {
                open_failures,
                read_failures,
                reads: Arc::clone(&reads),
                open: false,
            };
            (cam, reads)
        }
    }

    impl CameraDevice for ScriptedCamera {
        fn open(&mut self) -> Result<()> {
            if self.open_failures > 0 {
                self.open_failures -= 1;
                return Err(VigilError::Device("no camera".into()));
            }
            self.open = true;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn read_frame(&mut self) -> Result<Frame> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n < self.read_failures {
                return Err(VigilError::Device("select timeout".into()));
            }
            Ok(Frame::new(vec![n as u8], 1, 1))
        }

        fn close(&mut self) {
            self.open = false;
        }
    }

    fn fast_cfg() -> FrameSourceConfig {
        FrameSourceConfig {
            read_interval: Duration::from_millis(2),
            error_backoff: Duration::from_millis(40),
            open_attempts: 3,
            open_retry_delay: Duration::from_millis(1),
        }
    }

    fn statuses(rx: &mut tokio::sync::mpsc::UnboundedReceiver<PresentationUpdate>) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|u| match u {
                PresentationUpdate::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn read_failures_back_off_and_capture_resumes() {
        let (camera, reads) = ScriptedCamera::new(0, 3);
        let (presentation, mut rx) = ChannelPresentation::new();
        let cancel = CancellationToken::new();
        let (frames, handle) =
            FrameSource::spawn(camera, fast_cfg(), Arc::new(presentation), cancel.clone())
                .unwrap();

        // The first three reads fail, each followed by a 40 ms backoff.
        assert_eq!(frames.latest(), None);
        assert!(wait_for(|| frames.latest().is_some()));
        let first = frames.latest().unwrap();
        assert!(first.data[0] >= 3);

        // Still running: newer frames keep replacing the slot.
        assert!(wait_for(|| frames
            .latest()
            .is_some_and(|f| f.data[0] > first.data[0])));
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.join().unwrap();
        assert!(reads.load(Ordering::SeqCst) > 4);
        let read_errors = statuses(&mut rx)
            .into_iter()
            .filter(|s| s.starts_with("Camera read error"))
            .count();
        assert_eq!(read_errors, 1);
    }

    #[test]
    fn exhausted_open_attempts_disable_capture() {
        let (camera, reads) = ScriptedCamera::new(usize::MAX, 0);
        let (presentation, mut rx) = ChannelPresentation::new();
        let (frames, handle) = FrameSource::spawn(
            camera,
            fast_cfg(),
            Arc::new(presentation),
            CancellationToken::new(),
        )
        .unwrap();

        handle.join().unwrap();
        assert_eq!(frames.latest(), None);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert!(statuses(&mut rx)
            .iter()
            .any(|s| s.starts_with("Camera unavailable")));
    }

    #[test]
    fn splits_back_to_back_jpegs() {
        let mut buf = vec![0x00, 0x11, 0xFF, 0xD8, 1, 2, 0xFF, 0xD9, 0xFF, 0xD8, 3];
        let first = take_jpeg(&mut buf).unwrap();
        assert_eq!(first, vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);
        assert!(take_jpeg(&mut buf).is_none());
        assert_eq!(buf, vec![0xFF, 0xD8, 3]);
        buf.extend_from_slice(&[0xFF, 0xD9]);
        assert_eq!(take_jpeg(&mut buf).unwrap(), vec![0xFF, 0xD8, 3, 0xFF, 0xD9]);
        assert!(buf.is_empty());
    }

    #[test]
    fn no_soi_means_no_frame_and_garbage_is_dropped() {
        let mut buf = vec![1, 2, 3, 0xFF];
        assert!(take_jpeg(&mut buf).is_none());
        assert_eq!(buf, vec![0xFF]);

        // The kept byte can still start the next frame.
        buf.extend_from_slice(&[0xD8, 7, 0xFF, 0xD9]);
        assert_eq!(take_jpeg(&mut buf).unwrap(), vec![0xFF, 0xD8, 7, 0xFF, 0xD9]);

        let mut empty = Vec::new();
        assert!(take_jpeg(&mut empty).is_none());
        assert!(empty.is_empty());
    }
}
