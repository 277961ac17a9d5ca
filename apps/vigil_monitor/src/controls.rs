//! Line-based keyboard controls read from stdin.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigil_core::vision::SchedulerHandle;
use vigil_core::SpeechOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Stop the current audio and toggle vision analysis.
    SkipAndTogglePause,
    /// Stop the current audio only.
    Skip,
    Quit,
}

/// `space` or `p` toggles pause, `s` skips audio, `q` quits.
pub fn parse_control(line: &str) -> Option<Control> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line {
        " " | "p" | "P" => Some(Control::SkipAndTogglePause),
        "s" | "S" => Some(Control::Skip),
        "q" | "Q" => Some(Control::Quit),
        _ => None,
    }
}

pub fn spawn_controls(
    scheduler: SchedulerHandle,
    speech: Arc<dyn SpeechOutput>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                l = lines.next_line() => l,
            };
            let line = match line {
                Ok(Some(l)) => l,
                Ok(None) => break,
                Err(e) => {
                    warn!(target = "vigil_monitor", "stdin read failed: {}", e);
                    break;
                }
            };
            match parse_control(&line) {
                Some(Control::SkipAndTogglePause) => {
                    speech.skip();
                    if let Err(e) = scheduler.toggle_pause() {
                        warn!(target = "vigil_monitor", "Pause toggle failed: {}", e);
                    }
                }
                Some(Control::Skip) => speech.skip(),
                Some(Control::Quit) => {
                    info!(target = "vigil_monitor", "Quit requested");
                    cancel.cancel();
                    break;
                }
                None => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_each_control() {
        assert_eq!(parse_control(" "), Some(Control::SkipAndTogglePause));
        assert_eq!(parse_control("p\r\n"), Some(Control::SkipAndTogglePause));
        assert_eq!(parse_control("s"), Some(Control::Skip));
        assert_eq!(parse_control("q"), Some(Control::Quit));
        assert_eq!(parse_control("quit please"), None);
        assert_eq!(parse_control(""), None);
    }
}
