//! Append-only behavior log: one line per analysis event,
//! `YYYY-MM-DD HH:MM:SS - <code number> - <analysis text>`.

use crate::behavior::BehaviorCode;
use crate::Result;
use chrono::{Local, TimeZone};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BehaviorJournal {
    path: PathBuf,
}

impl BehaviorJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path from `BEHAVIOR_LOG`, else `behavior_log.txt` in the working dir.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("BEHAVIOR_LOG")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "behavior_log.txt".to_string()),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, timestamp_ms: i64, code: BehaviorCode, text: &str) -> Result<()> {
        let line = format_line(timestamp_ms, code, text);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(target = "router", path = %self.path.display(), code = code.number(), "Journal line written");
        Ok(())
    }
}

/// Newlines in the analysis are flattened so every event stays on one line.
pub fn format_line(timestamp_ms: i64, code: BehaviorCode, text: &str) -> String {
    let stamp = Local
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string());
    let flat = text.split(['\r', '\n']).filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ");
    format!("{} - {} - {}\n", stamp, code.number(), flat)
}
