use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use vigil_core::vision::{AnalysisCycle, CaptureScheduler, CycleOutcome, SchedulerConfig};

struct SlowCycle {
    active: AtomicUsize,
    max_active: AtomicUsize,
    runs: AtomicUsize,
    work: Duration,
    outcome: CycleOutcome,
}

impl SlowCycle {
    fn new(work: Duration, outcome: CycleOutcome) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            work,
            outcome,
        })
    }
}

#[async_trait]
impl AnalysisCycle for SlowCycle {
    async fn run_cycle(&self) -> CycleOutcome {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        sleep(self.work).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.outcome
    }
}

fn cfg() -> SchedulerConfig {
    SchedulerConfig {
        initial_delay: Duration::from_secs(2),
        rearm_delay: Duration::from_secs(10),
        retry_delay: Duration::from_secs(4),
        resume_delay: Duration::from_millis(500),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_never_overlap_cycles() {
    let cycle = SlowCycle::new(Duration::from_secs(3), CycleOutcome::Completed);
    let cancel = CancellationToken::new();
    let (handle, task) = CaptureScheduler::new(cycle.clone(), cfg())
        .start(cancel.clone())
        .unwrap();

    let mut spammers = Vec::new();
    for _ in 0..8 {
        let h = handle.clone();
        spammers.push(tokio::spawn(async move {
            for _ in 0..40 {
                let _ = h.trigger();
                sleep(Duration::from_millis(250)).await;
            }
        }));
    }
    for s in spammers {
        s.await.unwrap();
    }

    assert_eq!(cycle.max_active.load(Ordering::SeqCst), 1);
    let snap = handle.snapshot();
    assert!(snap.cycles_started >= 2);
    assert!(snap.triggers_ignored > 0);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn next_cycle_is_armed_after_completion() {
    let cycle = SlowCycle::new(Duration::from_secs(3), CycleOutcome::Completed);
    let cancel = CancellationToken::new();
    let (handle, _task) = CaptureScheduler::new(cycle.clone(), cfg())
        .start(cancel.clone())
        .unwrap();

    sleep(Duration::from_millis(1_900)).await;
    assert_eq!(handle.snapshot().cycles_started, 0);

    // first cycle runs 2s..5s, the next one is armed for 15s
    sleep(Duration::from_millis(12_900)).await;
    let snap = handle.snapshot();
    assert_eq!(snap.cycles_started, 1);
    assert_eq!(snap.cycles_completed, 1);
    assert!(!snap.in_flight);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.snapshot().cycles_started, 2);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn abandoned_cycle_uses_retry_delay() {
    let cycle = SlowCycle::new(Duration::from_secs(1), CycleOutcome::Abandoned);
    let cancel = CancellationToken::new();
    let (handle, _task) = CaptureScheduler::new(cycle.clone(), cfg())
        .start(cancel.clone())
        .unwrap();

    // 2s start, 3s abandon, 7s retry
    sleep(Duration::from_millis(6_900)).await;
    assert_eq!(handle.snapshot().cycles_abandoned, 1);
    assert_eq!(handle.snapshot().cycles_started, 1);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.snapshot().cycles_started, 2);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn pause_suspends_and_resume_triggers_shortly() {
    let cycle = SlowCycle::new(Duration::from_millis(100), CycleOutcome::Completed);
    let cancel = CancellationToken::new();
    let (handle, _task) = CaptureScheduler::new(cycle.clone(), cfg())
        .start(cancel.clone())
        .unwrap();

    handle.pause().unwrap();
    sleep(Duration::from_secs(30)).await;
    let snap = handle.snapshot();
    assert!(snap.paused);
    assert_eq!(snap.cycles_started, 0);

    handle.trigger().unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.snapshot().cycles_started, 0);

    handle.toggle_pause().unwrap();
    sleep(Duration::from_millis(400)).await;
    assert_eq!(handle.snapshot().cycles_started, 0);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.snapshot().cycles_started, 1);
    assert!(!handle.snapshot().paused);
    cancel.cancel();
}
