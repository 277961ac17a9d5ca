//! Self-rearming trigger for vision analysis cycles.
//!
//! A single task owns the scheduler state (paused, in flight, next
//! deadline); everything else talks to it through [`SchedulerHandle`]
//! commands. The next cycle is armed when the previous one reports back, so
//! a slow analysis stretches the period instead of overlapping it.

use crate::{Result, VigilError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// Collaborator failure or nothing to analyze; retried after the retry
    /// delay.
    Abandoned,
}

/// One vision analysis round.
#[async_trait]
pub trait AnalysisCycle: Send + Sync + 'static {
    async fn run_cycle(&self) -> CycleOutcome;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub initial_delay: Duration,
    pub rearm_delay: Duration,
    pub retry_delay: Duration,
    pub resume_delay: Duration,
}

impl Default for SchedulerConfig {
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
            initial_delay: ms("CAPTURE_INITIAL_DELAY_MS", 2_000),
            rearm_delay: ms("CAPTURE_CYCLE_DELAY_MS", 10_000),
            retry_delay: ms("CAPTURE_RETRY_DELAY_MS", 10_000),
            resume_delay: ms("CAPTURE_RESUME_DELAY_MS", 500),
        }
    }
}

/// Copy of the scheduler state for observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub paused: bool,
    pub in_flight: bool,
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_abandoned: u64,
    /// Triggers that arrived while paused or busy.
    pub triggers_ignored: u64,
}

#[derive(Debug)]
enum Command {
    Trigger,
    Pause,
    Resume,
    TogglePause,
    Finished(CycleOutcome),
}

/// Control surface of a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SchedulerSnapshot>,
}

impl SchedulerHandle {
    fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| VigilError::Queue("capture scheduler stopped".into()))
    }

    /// Request a cycle now. Ignored while paused or while one is in flight.
    pub fn trigger(&self) -> Result<()> {
        self.send(Command::Trigger)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub fn toggle_pause(&self) -> Result<()> {
        self.send(Command::TogglePause)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        *self.snapshot.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot.clone()
    }
}

pub struct CaptureScheduler<A: AnalysisCycle> {
    cycle: Arc<A>,
    cfg: SchedulerConfig,
}

impl<A: AnalysisCycle> CaptureScheduler<A> {
    pub fn new(cycle: Arc<A>, cfg: SchedulerConfig) -> Self {
        Self { cycle, cfg }
    }

    pub fn start(self, cancel: CancellationToken) -> Result<(SchedulerHandle, JoinHandle<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snap_tx, snap_rx) = watch::channel(SchedulerSnapshot::default());
        let handle = SchedulerHandle {
            tx: tx.clone(),
            snapshot: snap_rx,
        };
        let task = tokio::spawn(run_scheduler(self.cycle, self.cfg, tx, rx, snap_tx, cancel));
        Ok((handle, task))
    }
}

struct State {
    snap: SchedulerSnapshot,
    next_at: Option<Instant>,
}

async fn run_scheduler<A: AnalysisCycle>(
    cycle: Arc<A>,
    cfg: SchedulerConfig,
    tx: mpsc::UnboundedSender<Command>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    snap_tx: watch::Sender<SchedulerSnapshot>,
    cancel: CancellationToken,
) {
    let mut state = State {
        snap: SchedulerSnapshot::default(),
        next_at: Some(Instant::now() + cfg.initial_delay),
    };
    info!(target = "capture", initial_delay_ms = cfg.initial_delay.as_millis() as u64, "Capture scheduler started");

    loop {
        let deadline = state.next_at;
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                debug!(target = "capture", ?cmd, "Scheduler command");
                match cmd {
                    Command::Trigger => try_start(&mut state, &cycle, &tx, &cancel),
                    Command::Pause => set_paused(&mut state, true, &cfg),
                    Command::Resume => set_paused(&mut state, false, &cfg),
                    Command::TogglePause => {
                        let paused = !state.snap.paused;
                        set_paused(&mut state, paused, &cfg);
                    }
                    Command::Finished(outcome) => finish(&mut state, outcome, &cfg),
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                state.next_at = None;
                try_start(&mut state, &cycle, &tx, &cancel);
            }
        }
        snap_tx.send_replace(state.snap);
    }
    info!(target = "capture", "Capture scheduler stopped");
}

fn try_start<A: AnalysisCycle>(
    state: &mut State,
    cycle: &Arc<A>,
    tx: &mpsc::UnboundedSender<Command>,
    cancel: &CancellationToken,
) {
    if state.snap.paused || state.snap.in_flight {
        state.snap.triggers_ignored += 1;
        debug!(target = "capture", paused = state.snap.paused, in_flight = state.snap.in_flight, "Trigger ignored");
        return;
    }
    state.snap.in_flight = true;
    state.snap.cycles_started += 1;
    let n = state.snap.cycles_started;
    debug!(target = "capture", cycle = n, "Starting analysis cycle");

    let cycle = Arc::clone(cycle);
    let tx = tx.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let work = tokio::spawn(async move { cycle.run_cycle().await });
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            joined = work => joined.unwrap_or_else(|e| {
                error!(target = "capture", cycle = n, error = %e, "Analysis cycle panicked");
                CycleOutcome::Abandoned
            }),
        };
        let _ = tx.send(Command::Finished(outcome));
    });
}

fn set_paused(state: &mut State, paused: bool, cfg: &SchedulerConfig) {
    if state.snap.paused == paused {
        return;
    }
    state.snap.paused = paused;
    if paused {
        state.next_at = None;
        info!(target = "capture", "Analysis paused");
    } else {
        state.next_at = Some(Instant::now() + cfg.resume_delay);
        info!(target = "capture", "Analysis resumed");
    }
}

fn finish(state: &mut State, outcome: CycleOutcome, cfg: &SchedulerConfig) {
    state.snap.in_flight = false;
    let delay = match outcome {
        CycleOutcome::Completed => {
            state.snap.cycles_completed += 1;
            cfg.rearm_delay
        }
        CycleOutcome::Abandoned => {
            state.snap.cycles_abandoned += 1;
            cfg.retry_delay
        }
    };
    if !state.snap.paused {
        state.next_at = Some(Instant::now() + delay);
    }
    debug!(target = "capture", ?outcome, rearm_ms = delay.as_millis() as u64, "Analysis cycle finished");
}
