use crate::behavior::{BehaviorCode, BehaviorCounters};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const MIN_OBSERVATIONS: usize = 20;
pub const MAX_OBSERVATIONS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorObservation {
    pub timestamp_ms: i64,
    pub code: BehaviorCode,
    pub description: String,
    pub raw_text: String,
}

impl BehaviorObservation {
    pub fn new(timestamp_ms: i64, code: BehaviorCode, raw_text: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            code,
            description: code.description().to_string(),
            raw_text: raw_text.into(),
        }
    }
}

/// Answer to "did I do X?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recall {
    /// Matching detail records, newest first.
    Records(Vec<BehaviorObservation>),
    /// Detail records are gone but the counter still remembers.
    FromCounters { code: BehaviorCode, count: u64 },
    NoRecord(BehaviorCode),
}

/// Bounded FIFO of recent observations. Counters live elsewhere and outlive
/// whatever is trimmed from here.
#[derive(Debug, Clone)]
pub struct ObservationLog {
    entries: VecDeque<BehaviorObservation>,
    cap: usize,
}

impl Default for ObservationLog {
    fn default() -> Self {
        Self::new(MIN_OBSERVATIONS)
    }
}

impl ObservationLog {
    pub fn new(cap: usize) -> Self {
        let cap = cap.clamp(MIN_OBSERVATIONS, MAX_OBSERVATIONS);
        Self {
            entries: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, observation: BehaviorObservation) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(observation);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn last(&self) -> Option<&BehaviorObservation> {
        self.entries.back()
    }

    /// Up to `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &BehaviorObservation> {
        self.entries.iter().rev().take(n)
    }

    pub fn recall(&self, code: BehaviorCode, counters: &BehaviorCounters) -> Recall {
        let matches: Vec<BehaviorObservation> = self
            .entries
            .iter()
            .rev()
            .filter(|o| o.code == code)
            .cloned()
            .collect();
        if !matches.is_empty() {
            return Recall::Records(matches);
        }
        match counters.get(code) {
            0 => Recall::NoRecord(code),
            count => Recall::FromCounters { code, count },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_clamped_and_fifo() {
        assert_eq!(ObservationLog::new(5).cap(), 20);
        assert_eq!(ObservationLog::new(500).cap(), 100);

        let mut log = ObservationLog::new(20);
        for i in 0..25 {
            log.push(BehaviorObservation::new(i, BehaviorCode::Work, format!("obs {i}")));
        }
        assert_eq!(log.len(), 20);
        assert_eq!(log.recent(1).next().map(|o| o.timestamp_ms), Some(24));
        assert_eq!(log.recent(100).last().map(|o| o.timestamp_ms), Some(5));
    }

    #[test]
    fn recall_falls_back_to_counters_when_history_is_empty() {
        let log = ObservationLog::default();
        let mut counters = BehaviorCounters::default();
        counters.set(BehaviorCode::Eating, 3);
        assert_eq!(
            log.recall(BehaviorCode::Eating, &counters),
            Recall::FromCounters {
                code: BehaviorCode::Eating,
                count: 3
            }
        );
        assert_eq!(
            log.recall(BehaviorCode::Phone, &counters),
            Recall::NoRecord(BehaviorCode::Phone)
        );
    }

    #[test]
    fn recall_prefers_detail_records() {
        let mut log = ObservationLog::default();
        log.push(BehaviorObservation::new(1, BehaviorCode::Phone, "scrolling"));
        log.push(BehaviorObservation::new(2, BehaviorCode::Work, "typing"));
        let counters = BehaviorCounters::default();
        match log.recall(BehaviorCode::Phone, &counters) {
            Recall::Records(r) => assert_eq!(r[0].raw_text, "scrolling"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
