//! Shared time and id helpers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp in milliseconds since UNIX epoch.
/// Used for event timestamps and placeholder ids across components.
#[inline]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

static ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a short unique id from the current time in nanoseconds plus a
/// process-wide counter, so two ids minted in the same nanosecond differ.
#[inline]
pub fn gen_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{:04x}", nanos, seq & 0xffff)
}

/// Truncate to at most `max` characters (not bytes), appending "..." when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_in_a_tight_loop() {
        let a = gen_id();
        let b = gen_id();
        assert_ne!(a, b);
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate_chars("喝饮料了吗", 3), "喝饮料...");
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
