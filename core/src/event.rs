// Event queue implementation
use crate::behavior::BehaviorCode;
use crate::vision::Frame;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// Scheduling tier shared by the router queue and the playback queue.
/// Lower value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Voice input / spoken replies to the user: interrupt now.
    Interrupt = 1,
    /// Vision analysis and proactive feedback.
    Normal = 2,
}

impl Priority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Self {
        if v <= 1 {
            Priority::Interrupt
        } else {
            Priority::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Vision,
    Voice,
}

/// Result of one vision analysis cycle.
#[derive(Debug, Clone)]
pub struct VisionAnalysis {
    pub text: String,
    pub code: BehaviorCode,
    pub image_urls: Vec<String>,
    pub display_frame: Option<Frame>,
    pub timestamp_ms: i64,
    /// Placeholder inserted by the dispatcher, resolved in place by the router.
    pub placeholder_id: Option<String>,
}

/// One transcribed utterance.
#[derive(Debug, Clone)]
pub struct VoiceInput {
    pub text: String,
    pub tags: Vec<String>,
    pub timestamp_ms: i64,
    pub placeholder_id: Option<String>,
}

/// Everything the router consumes. Each kind carries its own payload.
#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    Vision(VisionAnalysis),
    Voice(VoiceInput),
}

impl AnalysisEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AnalysisEvent::Vision(_) => EventKind::Vision,
            AnalysisEvent::Voice(_) => EventKind::Voice,
        }
    }

    /// Default tier for the kind: voice before vision.
    pub fn priority(&self) -> Priority {
        match self {
            AnalysisEvent::Vision(_) => Priority::Normal,
            AnalysisEvent::Voice(_) => Priority::Interrupt,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            AnalysisEvent::Vision(v) => &v.text,
            AnalysisEvent::Voice(v) => &v.text,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            AnalysisEvent::Vision(v) => v.timestamp_ms,
            AnalysisEvent::Voice(v) => v.timestamp_ms,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            AnalysisEvent::Vision(v) => v.placeholder_id.as_deref(),
            AnalysisEvent::Voice(v) => v.placeholder_id.as_deref(),
        }
    }
}

/// An event as handed to the consumer, with its queue position.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub priority: Priority,
    pub seq: u64,
    pub event: AnalysisEvent,
}

// BinaryHeap is a max-heap; invert so the smallest (priority, seq) pops first.
impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Event queue statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EventQueueStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub backlog_size: usize,
    pub rejected_after_close: u64,
}

struct Inner {
    heap: Mutex<BinaryHeap<QueuedEvent>>,
    notify: Notify,
    next_seq: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicBool,
}

/// Multi-producer, single-consumer priority queue ordered by
/// (priority, monotonic sequence id). Cloning shares the queue.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                next_seq: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<QueuedEvent>> {
        self.inner.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish at the event's default tier. Returns the sequence id, or
    /// `None` if the queue was closed.
    pub fn publish(&self, event: AnalysisEvent) -> Option<u64> {
        let priority = event.priority();
        self.publish_with(priority, event)
    }

    /// Publish at an explicit tier.
    pub fn publish_with(&self, priority: Priority, event: AnalysisEvent) -> Option<u64> {
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let kind = event.kind();
        let seq = {
            // Allocate under the heap lock so ids enter the heap in order.
            let mut heap = self.heap();
            let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
            heap.push(QueuedEvent {
                priority,
                seq,
                event,
            });
            seq
        };
        debug!(target = "router", seq, priority = priority.as_u8(), ?kind, "Queued event");
        self.inner.notify.notify_one();
        Some(seq)
    }

    /// Pop the next event without waiting.
    pub fn try_recv(&self) -> Option<QueuedEvent> {
        let item = self.heap().pop();
        if item.is_some() {
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Wait for the next event. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<QueuedEvent> {
        loop {
            // Permit is stored by notify_one even if nobody waits yet.
            let notified = self.inner.notify.notified();
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting events and wake the consumer.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> EventQueueStats {
        EventQueueStats {
            total_published: self.inner.next_seq.load(Ordering::SeqCst),
            total_delivered: self.inner.delivered.load(Ordering::Relaxed),
            backlog_size: self.len(),
            rejected_after_close: self.inner.rejected.load(Ordering::Relaxed),
        }
    }
}
