//! Spoken reply scheduling.
//!
//! A small priority queue in front of a single playback worker:
//! - priority 1 (reply to the user) purges everything queued ("barge-in")
//! - priority 2 keeps only the freshest `max_normal` items
//! - a priority 2 item older than the staleness bound is dropped unplayed,
//!   before synthesis
//!
//! The worker raises the shared [`SpeakingFlag`] only while audio is
//! actually coming out of the speakers; `skip` clears it immediately.

use crate::tts::get_from_path;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::collab::{SpeechSynthesizer, VoiceSpec};
use vigil_core::utils::{gen_id, truncate_chars};
use vigil_core::{Priority, Result, SpeakingFlag, SpeechOutput, VigilError};

#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub id: u64,
    pub text: String,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Normal-priority items kept waiting; older ones are evicted.
    pub max_normal: usize,
    /// Normal-priority items older than this are dropped unplayed.
    pub stale_after: Duration,
    pub voice: VoiceSpec,
    pub synth_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        let max_normal = std::env::var("PLAYBACK_MAX_NORMAL")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1);
        let stale_ms = std::env::var("PLAYBACK_STALE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10_000);
        let synth_ms = std::env::var("TTS_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(20_000);
        let voice = VoiceSpec {
            voice: std::env::var("TTS_VOICE").ok(),
            rate: std::env::var("TTS_RATE").ok().and_then(|v| v.parse().ok()),
            volume: std::env::var("TTS_VOLUME").ok().and_then(|v| v.parse().ok()),
        };
        Self {
            max_normal,
            stale_after: Duration::from_millis(stale_ms),
            voice,
            synth_timeout: Duration::from_millis(synth_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub enqueued: u64,
    /// Removed by a priority 1 arrival.
    pub purged: u64,
    /// Oldest normal items pushed out by a newer one.
    pub evicted: u64,
    pub stale_dropped: u64,
    pub played: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Pure queue logic; the scheduler wraps it in a mutex.
#[derive(Debug)]
pub struct PlaybackQueue {
    items: VecDeque<PlaybackRequest>,
    max_normal: usize,
    stale_after: Duration,
    next_id: u64,
    stats: PlaybackStats,
}

impl PlaybackQueue {
    pub fn new(max_normal: usize, stale_after: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            max_normal: max_normal.max(1),
            stale_after,
            next_id: 0,
            stats: PlaybackStats::default(),
        }
    }

    pub fn push(&mut self, text: impl Into<String>, priority: Priority, now: Instant) -> u64 {
        match priority {
            Priority::Interrupt => {
                self.stats.purged += self.items.len() as u64;
                self.items.clear();
            }
            Priority::Normal => {
                while self.normal_len() >= self.max_normal {
                    let Some(pos) = self
                        .items
                        .iter()
                        .position(|r| r.priority == Priority::Normal)
                    else {
                        break;
                    };
                    self.items.remove(pos);
                    self.stats.evicted += 1;
                }
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.items.push_back(PlaybackRequest {
            id,
            text: text.into(),
            priority,
            enqueued_at: now,
        });
        self.stats.enqueued += 1;
        id
    }

    /// Next request in (priority, id) order, skipping stale normal items.
    pub fn pop_playable(&mut self, now: Instant) -> Option<PlaybackRequest> {
        loop {
            let pos = self
                .items
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| (r.priority, r.id))
                .map(|(i, _)| i)?;
            let req = self.items.remove(pos)?;
            if req.priority == Priority::Normal
                && now.saturating_duration_since(req.enqueued_at) > self.stale_after
            {
                self.stats.stale_dropped += 1;
                debug!(target = "playback", id = req.id, "Dropping stale request");
                continue;
            }
            return Some(req);
        }
    }

    fn normal_len(&self) -> usize {
        self.items
            .iter()
            .filter(|r| r.priority == Priority::Normal)
            .count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }
}

/// Plays WAV bytes. Must return promptly once `cancel` fires.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, wav: Vec<u8>, cancel: CancellationToken) -> Result<()>;
}

struct Shared {
    queue: Mutex<PlaybackQueue>,
    notify: Notify,
    speaking: SpeakingFlag,
    /// Request id and stop token of the active playback.
    current: Mutex<Option<(u64, CancellationToken)>>,
    worker_started: AtomicBool,
    stats_tx: watch::Sender<PlaybackStats>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, PlaybackQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_queue<R>(&self, f: impl FnOnce(&mut PlaybackQueue) -> R) -> R {
        let mut q = self.queue();
        let out = f(&mut q);
        self.stats_tx.send_replace(q.stats());
        out
    }
}

/// Handle to the playback queue. Cloning shares it.
#[derive(Clone)]
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    cfg: Arc<PlaybackConfig>,
}

impl PlaybackScheduler {
    pub fn new(cfg: PlaybackConfig, speaking: SpeakingFlag) -> Self {
        let (stats_tx, _) = watch::channel(PlaybackStats::default());
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(PlaybackQueue::new(cfg.max_normal, cfg.stale_after)),
                notify: Notify::new(),
                speaking,
                current: Mutex::new(None),
                worker_started: AtomicBool::new(false),
                stats_tx,
            }),
            cfg: Arc::new(cfg),
        }
    }

    pub fn speaking_flag(&self) -> SpeakingFlag {
        self.shared.speaking.clone()
    }

    pub fn enqueue(&self, text: &str, priority: Priority) -> u64 {
        let id = self
            .shared
            .with_queue(|q| q.push(text, priority, Instant::now()));
        debug!(
            target = "playback",
            id,
            priority = priority.as_u8(),
            text = %truncate_chars(text, 60),
            "Enqueued"
        );
        self.shared.notify.notify_one();
        id
    }

    /// Stop the active playback, if any. The speaking flag clears now, not
    /// when the player process exits.
    pub fn skip(&self) {
        let active = self.shared.current().take();
        if let Some((_, token)) = active {
            token.cancel();
            self.shared.with_queue(|q| q.stats.skipped += 1);
            info!(target = "playback", "Playback skipped");
        }
        self.shared.speaking.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PlaybackStats {
        self.shared.queue().stats()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStats> {
        self.shared.stats_tx.subscribe()
    }

    /// Spawn the single playback worker. A second call fails.
    pub fn start(
        &self,
        synth: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        if self.shared.worker_started.swap(true, Ordering::SeqCst) {
            return Err(VigilError::Queue("playback worker already running".into()));
        }
        let shared = Arc::clone(&self.shared);
        let cfg = Arc::clone(&self.cfg);
        Ok(tokio::spawn(async move {
            info!(target = "playback", "Playback worker started");
            while let Some(req) = next_request(&shared, &cancel).await {
                play_one(&shared, &cfg, synth.as_ref(), sink.as_ref(), &cancel, req).await;
            }
            shared.speaking.clear();
            info!(target = "playback", "Playback worker stopped");
        }))
    }
}

async fn next_request(shared: &Shared, cancel: &CancellationToken) -> Option<PlaybackRequest> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(req) = shared.with_queue(|q| q.pop_playable(Instant::now())) {
            return Some(req);
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = shared.notify.notified() => {}
        }
    }
}

async fn play_one(
    shared: &Shared,
    cfg: &PlaybackConfig,
    synth: &dyn SpeechSynthesizer,
    sink: &dyn AudioSink,
    cancel: &CancellationToken,
    req: PlaybackRequest,
) {
    let token = cancel.child_token();
    *shared.current() = Some((req.id, token.clone()));

    let synthesized = tokio::select! {
        _ = token.cancelled() => None,
        r = timeout(cfg.synth_timeout, synth.synthesize(&req.text, &cfg.voice)) => Some(r),
    };
    let wav = match synthesized {
        None => {
            debug!(target = "playback", id = req.id, "Skipped during synthesis");
            return;
        }
        Some(Ok(Ok(wav))) => wav,
        Some(Ok(Err(e))) => {
            warn!(target = "playback", id = req.id, "Synthesis failed: {}", e);
            finish(shared, req.id, |s| s.failed += 1);
            return;
        }
        Some(Err(_)) => {
            warn!(target = "playback", id = req.id, "Synthesis timed out");
            finish(shared, req.id, |s| s.failed += 1);
            return;
        }
    };
    if token.is_cancelled() {
        return;
    }

    shared.speaking.set_active();
    debug!(target = "playback", id = req.id, priority = req.priority.as_u8(), "Playing");
    let result = sink.play(wav, token.clone()).await;
    shared.speaking.clear();

    match result {
        Ok(()) if token.is_cancelled() => {}
        Ok(()) => finish(shared, req.id, |s| s.played += 1),
        Err(e) => {
            warn!(target = "playback", id = req.id, "Playback failed: {}", e);
            finish(shared, req.id, |s| s.failed += 1);
        }
    }
}

fn finish(shared: &Shared, id: u64, bump: impl FnOnce(&mut PlaybackStats)) {
    {
        let mut current = shared.current();
        if current.as_ref().is_some_and(|(active, _)| *active == id) {
            *current = None;
        }
    }
    shared.with_queue(|q| bump(&mut q.stats));
}

impl SpeechOutput for PlaybackScheduler {
    fn speak(&self, text: &str, priority: Priority) {
        self.enqueue(text, priority);
    }

    fn skip(&self) {
        PlaybackScheduler::skip(self);
    }
}

/// Plays WAV files through aplay, paplay or ffplay.
#[derive(Clone, Debug)]
pub struct CliPlayer {
    player: PathBuf,
    temp_dir: PathBuf,
}

impl CliPlayer {
    /// `PLAYBACK_PLAYER` wins if installed, then aplay, paplay, ffplay.
    pub fn detect() -> Option<Self> {
        let pref = std::env::var("PLAYBACK_PLAYER").ok();
        let player = pref
            .as_deref()
            .into_iter()
            .chain(["aplay", "paplay", "ffplay"])
            .find_map(get_from_path)?;
        let temp_dir = std::env::var("TTS_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        Some(Self { player, temp_dir })
    }

    pub fn with_player(player: PathBuf, temp_dir: PathBuf) -> Self {
        Self { player, temp_dir }
    }

    fn command(&self, wav: &std::path::Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.player);
        let name = self
            .player
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        match name {
            "ffplay" => {
                cmd.arg("-autoexit").arg("-nodisp").arg("-loglevel").arg("quiet");
            }
            "aplay" => {
                cmd.arg("-q");
            }
            _ => {}
        }
        cmd.arg(wav);
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AudioSink for CliPlayer {
    async fn play(&self, wav: Vec<u8>, cancel: CancellationToken) -> Result<()> {
        let path = self.temp_dir.join(format!("vigil_play_{}.wav", gen_id()));
        tokio::fs::write(&path, &wav).await?;
        let result: Result<()> = async {
            let mut child = self.command(&path).spawn()?;
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    if !status.success() {
                        return Err(VigilError::Device(format!("player exited with {}", status)));
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                }
            }
            Ok(())
        }
        .await;
        let _ = tokio::fs::remove_file(&path).await;
        result
    }
}
