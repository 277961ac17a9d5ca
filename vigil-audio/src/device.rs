//! Keeps a capture device open for the life of its thread.
//!
//! The opener builds and starts a stream and hands the driver's error
//! callback a [`FaultFlag`]. When the flag is raised the stream is dropped and
//! reopened under the same bounded retry policy used at startup; running out
//! of attempts is reported as the loss of that subsystem.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_core::collab::PresentationSink;
use vigil_core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    /// How often the owning thread checks for cancel or a fault.
    pub poll: Duration,
}

/// Raised from a driver callback when the running stream has failed.
#[derive(Debug, Clone, Default)]
pub struct FaultFlag(Arc<AtomicBool>);

impl FaultFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Cancelled, or the consumer went away.
    Stopped,
    /// Every open attempt failed.
    Unavailable,
}

/// Run device sessions on the calling thread until cancel, until
/// `keep_running` turns false, or until the device cannot be reopened.
pub fn supervise<S, O, K>(
    device: &str,
    policy: RetryPolicy,
    presentation: &dyn PresentationSink,
    cancel: &CancellationToken,
    keep_running: K,
    mut open: O,
) -> SessionEnd
where
    O: FnMut(FaultFlag) -> Result<S>,
    K: Fn() -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut sessions = 0u32;
    loop {
        let fault = FaultFlag::new();
        let mut attempt = 0;
        let session = loop {
            if cancel.is_cancelled() {
                return SessionEnd::Stopped;
            }
            attempt += 1;
            match open(fault.clone()) {
                Ok(s) => break s,
                Err(e) if attempt < attempts => {
                    warn!(target = "vad", device, attempt, "Open failed: {}", e);
                    thread::sleep(policy.delay);
                }
                Err(e) => {
                    error!(target = "vad", device, attempts = attempt, "Device unavailable: {}", e);
                    presentation.push_status(&format!("{device} unavailable: {e}"));
                    return SessionEnd::Unavailable;
                }
            }
        };
        sessions += 1;
        if sessions == 1 {
            presentation.push_status(&format!("{device} ready"));
        } else {
            info!(target = "vad", device, sessions, "Device reopened");
            presentation.push_status(&format!("{device} recovered"));
        }

        while !cancel.is_cancelled() && keep_running() && !fault.is_raised() {
            thread::sleep(policy.poll);
        }
        drop(session);
        if cancel.is_cancelled() || !keep_running() {
            return SessionEnd::Stopped;
        }

        warn!(target = "vad", device, "Stream failed; reopening");
        presentation.push_status(&format!("{device} lost, reopening..."));
        thread::sleep(policy.delay);
    }
}
