//! Behavior taxonomy, text classification and the reminder/encouragement
//! decision logic.
//!
//! [`BehaviorTracker::observe`] is pure: it takes the previous
//! [`TrackerState`] by value and returns the next one together with at most
//! one [`Instruction`]. The router is the only caller, so the state never
//! needs a lock.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Closed set of observed activities. `Unclassified` is what unmatched
/// analysis text resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorCode {
    Unclassified,
    Work,
    Eating,
    DrinkingWater,
    DrinkingBeverage,
    Phone,
    Sleeping,
    Other,
}

use BehaviorCode::*;

impl BehaviorCode {
    /// The seven real categories in their numbered order (also the keyword
    /// fallback order).
    pub const CATEGORIES: [BehaviorCode; 7] = [
        Work,
        Eating,
        DrinkingWater,
        DrinkingBeverage,
        Phone,
        Sleeping,
        Other,
    ];

    pub fn number(self) -> u8 {
        match self {
            Unclassified => 0,
            Work => 1,
            Eating => 2,
            DrinkingWater => 3,
            DrinkingBeverage => 4,
            Phone => 5,
            Sleeping => 6,
            Other => 7,
        }
    }

    pub fn from_number(n: u8) -> Self {
        match n {
            1 => Work,
            2 => Eating,
            3 => DrinkingWater,
            4 => DrinkingBeverage,
            5 => Phone,
            6 => Sleeping,
            7 => Other,
            _ => Unclassified,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Unclassified => "unclassified",
            Work => "work",
            Eating => "eating",
            DrinkingWater => "drinking_water",
            DrinkingBeverage => "drinking_beverage",
            Phone => "phone",
            Sleeping => "sleeping",
            Other => "other",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Unclassified => "unrecognized",
            Work => "focused work",
            Eating => "eating",
            DrinkingWater => "drinking water",
            DrinkingBeverage => "drinking a beverage",
            Phone => "using the phone",
            Sleeping => "sleeping",
            Other => "other",
        }
    }

    /// Labels the vision model may use for this category. ASCII labels are
    /// matched on word boundaries, the rest as plain substrings.
    fn labels(self) -> &'static [&'static str] {
        match self {
            Unclassified => &[],
            Work => &["focused work", "working attentively", "认真专注工作"],
            Eating => &["eating", "吃东西"],
            DrinkingWater => &["drinking water", "用杯子喝水"],
            DrinkingBeverage => &["drinking a beverage", "beverage", "喝饮料"],
            Phone => &["using the phone", "using phone", "playing with phone", "玩手机"],
            Sleeping => &["sleeping", "睡觉"],
            Other => &["other", "其他"],
        }
    }

    /// Codes that end a sitting run.
    pub fn indicates_away(self) -> bool {
        matches!(self, Other | Unclassified)
    }
}

impl fmt::Display for BehaviorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

fn label_pattern(label: &str) -> String {
    let escaped = regex::escape(label);
    if label.is_ascii() {
        format!(r"\b{}\b", escaped)
    } else {
        escaped
    }
}

fn numbered_regex() -> Option<&'static Regex> {
    static NUMBERED: OnceLock<Option<Regex>> = OnceLock::new();
    NUMBERED
        .get_or_init(|| {
            let alternatives: Vec<String> = BehaviorCode::CATEGORIES
                .iter()
                .flat_map(|c| c.labels().iter())
                .map(|l| regex::escape(l))
                .collect();
            let pattern = format!(r"(?i)([1-7])\s*[.、:：)]?\s*({})", alternatives.join("|"));
            Regex::new(&pattern).ok()
        })
        .as_ref()
}

fn keyword_regexes() -> &'static [(BehaviorCode, Regex)] {
    static KEYWORDS: OnceLock<Vec<(BehaviorCode, Regex)>> = OnceLock::new();
    KEYWORDS.get_or_init(|| {
        BehaviorCode::CATEGORIES
            .iter()
            .filter_map(|&code| {
                let alts: Vec<String> = code.labels().iter().map(|l| label_pattern(l)).collect();
                Regex::new(&format!("(?i){}", alts.join("|")))
                    .ok()
                    .map(|re| (code, re))
            })
            .collect()
    })
}

/// Map free-form analysis text onto the closed vocabulary.
///
/// A numbered verdict ("5. using the phone", "5.玩手机") wins; otherwise the
/// first category whose label occurs in the text, in numbered order.
pub fn classify(text: &str) -> BehaviorCode {
    if let Some(caps) = numbered_regex().and_then(|re| re.captures(text)) {
        let n = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<u8>().ok())
            .unwrap_or(0);
        let code = BehaviorCode::from_number(n);
        if code != Unclassified {
            return code;
        }
    }
    keyword_regexes()
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(code, _)| *code)
        .unwrap_or(Unclassified)
}

/// Per-code observation counts. Never decremented within a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorCounters(BTreeMap<BehaviorCode, u64>);

impl BehaviorCounters {
    pub fn get(&self, code: BehaviorCode) -> u64 {
        self.0.get(&code).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, code: BehaviorCode) -> u64 {
        let n = self.0.entry(code).or_insert(0);
        *n += 1;
        *n
    }

    pub fn set(&mut self, code: BehaviorCode, count: u64) {
        self.0.insert(code, count);
    }

    pub fn iter(&self) -> impl Iterator<Item = (BehaviorCode, u64)> + '_ {
        self.0.iter().map(|(c, n)| (*c, *n))
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    Eating,
    Beverage,
    Phone,
    Sitting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncouragementKind {
    Work,
    Water,
}

/// What the reply generator should be asked to do. Only a template key;
/// the wording lives in the prompt builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    Reminder(ReminderKind),
    Encouragement(EncouragementKind),
}

impl Instruction {
    pub fn template_key(self) -> &'static str {
        match self {
            Instruction::Reminder(ReminderKind::Eating) => "reminder.eating",
            Instruction::Reminder(ReminderKind::Beverage) => "reminder.beverage",
            Instruction::Reminder(ReminderKind::Phone) => "reminder.phone",
            Instruction::Reminder(ReminderKind::Sitting) => "reminder.sitting",
            Instruction::Encouragement(EncouragementKind::Work) => "encourage.work",
            Instruction::Encouragement(EncouragementKind::Water) => "encourage.water",
        }
    }

    fn cooldown_key(self) -> CooldownKey {
        match self {
            Instruction::Reminder(ReminderKind::Eating) => CooldownKey::Eating,
            Instruction::Reminder(ReminderKind::Beverage) => CooldownKey::Beverage,
            Instruction::Reminder(ReminderKind::Phone) => CooldownKey::Phone,
            Instruction::Reminder(ReminderKind::Sitting) => CooldownKey::Sitting,
            Instruction::Encouragement(_) => CooldownKey::Encouragement,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownKey {
    Eating,
    Beverage,
    Phone,
    Sitting,
    Encouragement,
}

/// Whether every feedback category waits on its own clock or all of them
/// share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownPolicy {
    #[default]
    PerCategory,
    Shared,
}

impl CooldownPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_category" | "per-category" | "independent" => Some(CooldownPolicy::PerCategory),
            "shared" => Some(CooldownPolicy::Shared),
            _ => None,
        }
    }
}

/// Last time (ms) each feedback category fired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderState {
    last_fired_ms: BTreeMap<CooldownKey, i64>,
}

impl ReminderState {
    pub fn last_fired(&self, key: CooldownKey) -> Option<i64> {
        self.last_fired_ms.get(&key).copied()
    }

    fn ready(&self, key: CooldownKey, now_ms: i64, interval: Duration, policy: CooldownPolicy) -> bool {
        let last = match policy {
            CooldownPolicy::PerCategory => self.last_fired(key),
            CooldownPolicy::Shared => self.last_fired_ms.values().copied().max(),
        };
        match last {
            Some(t) => now_ms - t > interval.as_millis() as i64,
            None => true,
        }
    }

    fn mark(&mut self, key: CooldownKey, now_ms: i64) {
        self.last_fired_ms.insert(key, now_ms);
    }
}

/// Everything the tracker remembers between observations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerState {
    pub counters: BehaviorCounters,
    pub reminders: ReminderState,
    pub last_code: Option<BehaviorCode>,
    /// Start of the current run of identical codes.
    pub run_started_ms: Option<i64>,
    /// Start of the current sitting stretch; `None` while away.
    pub sitting_since_ms: Option<i64>,
}

impl TrackerState {
    /// Fresh state for a session that starts (seated) at `now_ms`.
    pub fn starting_at(now_ms: i64) -> Self {
        Self {
            sitting_since_ms: Some(now_ms),
            ..Self::default()
        }
    }

    pub fn sitting_ms(&self, now_ms: i64) -> i64 {
        self.sitting_since_ms
            .map(|s| (now_ms - s).max(0))
            .unwrap_or(0)
    }
}

/// Thresholds and cooldowns for feedback.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub eating_threshold: u64,
    pub beverage_threshold: u64,
    pub phone_threshold: u64,
    pub sitting_threshold: Duration,
    pub work_encouragement_after: Duration,
    pub reminder_interval: Duration,
    pub cooldown: CooldownPolicy,
    /// Count reminders only fire while the person is doing that thing.
    pub require_current_match: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        let secs = |key: &str, default: u64| {
            Duration::from_secs(
                std::env::var(key)
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(default),
            )
        };
        let count = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            eating_threshold: count("TRACKER_EATING_THRESHOLD", 2),
            beverage_threshold: count("TRACKER_BEVERAGE_THRESHOLD", 2),
            phone_threshold: count("TRACKER_PHONE_THRESHOLD", 1),
            sitting_threshold: secs("TRACKER_SITTING_SECS", 30 * 60),
            work_encouragement_after: secs("TRACKER_WORK_ENCOURAGE_SECS", 10 * 60),
            reminder_interval: secs("TRACKER_REMINDER_INTERVAL_SECS", 10 * 60),
            cooldown: std::env::var("TRACKER_COOLDOWN")
                .ok()
                .and_then(|v| CooldownPolicy::parse(&v))
                .unwrap_or_default(),
            require_current_match: std::env::var("TRACKER_REQUIRE_CURRENT_MATCH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

/// Outcome of one observation.
#[derive(Debug, Clone)]
pub struct Observed {
    pub state: TrackerState,
    pub instruction: Option<Instruction>,
    /// How long the current code has been seen without interruption.
    pub continuous_ms: i64,
    pub sitting_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BehaviorTracker {
    cfg: TrackerConfig,
}

impl BehaviorTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.cfg
    }

    /// Fold one observation into the state and decide on feedback.
    pub fn observe(&self, mut state: TrackerState, code: BehaviorCode, now_ms: i64) -> Observed {
        state.counters.increment(code);

        let continuous_ms = if state.last_code == Some(code) {
            now_ms - state.run_started_ms.unwrap_or(now_ms)
        } else {
            state.run_started_ms = Some(now_ms);
            0
        };
        state.last_code = Some(code);

        if code.indicates_away() {
            state.sitting_since_ms = None;
        } else if state.sitting_since_ms.is_none() {
            state.sitting_since_ms = Some(now_ms);
        }
        let sitting_ms = state.sitting_ms(now_ms);

        let instruction = self
            .pick_reminder(&state, code, sitting_ms, now_ms)
            .map(Instruction::Reminder)
            .or_else(|| {
                self.pick_encouragement(&state, code, continuous_ms, now_ms)
                    .map(Instruction::Encouragement)
            });

        if let Some(i) = instruction {
            state.reminders.mark(i.cooldown_key(), now_ms);
        }

        Observed {
            state,
            instruction,
            continuous_ms,
            sitting_ms,
        }
    }

    fn ready(&self, state: &TrackerState, key: CooldownKey, now_ms: i64) -> bool {
        state
            .reminders
            .ready(key, now_ms, self.cfg.reminder_interval, self.cfg.cooldown)
    }

    // Fixed precedence: eating, beverage, phone, sitting.
    fn pick_reminder(
        &self,
        state: &TrackerState,
        code: BehaviorCode,
        sitting_ms: i64,
        now_ms: i64,
    ) -> Option<ReminderKind> {
        let counted = [
            (ReminderKind::Eating, Eating, self.cfg.eating_threshold, CooldownKey::Eating),
            (
                ReminderKind::Beverage,
                DrinkingBeverage,
                self.cfg.beverage_threshold,
                CooldownKey::Beverage,
            ),
            (ReminderKind::Phone, Phone, self.cfg.phone_threshold, CooldownKey::Phone),
        ];
        for (kind, watched, threshold, key) in counted {
            if self.cfg.require_current_match && code != watched {
                continue;
            }
            if state.counters.get(watched) >= threshold && self.ready(state, key, now_ms) {
                return Some(kind);
            }
        }
        if sitting_ms >= self.cfg.sitting_threshold.as_millis() as i64
            && self.ready(state, CooldownKey::Sitting, now_ms)
        {
            return Some(ReminderKind::Sitting);
        }
        None
    }

    fn pick_encouragement(
        &self,
        state: &TrackerState,
        code: BehaviorCode,
        continuous_ms: i64,
        now_ms: i64,
    ) -> Option<EncouragementKind> {
        let kind = match code {
            Work if continuous_ms > self.cfg.work_encouragement_after.as_millis() as i64 => {
                EncouragementKind::Work
            }
            DrinkingWater => EncouragementKind::Water,
            _ => return None,
        };
        self.ready(state, CooldownKey::Encouragement, now_ms)
            .then_some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn tracker() -> BehaviorTracker {
        BehaviorTracker::new(TrackerConfig {
            eating_threshold: 2,
            beverage_threshold: 2,
            phone_threshold: 1,
            sitting_threshold: Duration::from_secs(30 * 60),
            work_encouragement_after: Duration::from_secs(10 * 60),
            reminder_interval: Duration::from_secs(10 * 60),
            cooldown: CooldownPolicy::PerCategory,
            require_current_match: false,
        })
    }

    #[test]
    fn classify_prefers_numbered_verdict() {
        assert_eq!(classify("判断结果：5.玩手机，他低头看屏幕"), Phone);
        assert_eq!(classify("Verdict: 2. eating a sandwich at the desk"), Eating);
        assert_eq!(classify("Conclusion 3: drinking water"), DrinkingWater);
    }

    #[test]
    fn classify_falls_back_to_keywords_in_order() {
        assert_eq!(classify("The person is drinking water from a mug"), DrinkingWater);
        assert_eq!(classify("他正在喝饮料"), DrinkingBeverage);
        assert_eq!(classify("Seems to be sleeping on the keyboard"), Sleeping);
        assert_eq!(classify("Looks like focused work, typing steadily"), Work);
    }

    #[test]
    fn classify_unmatched_is_unclassified() {
        assert_eq!(classify("The image is too dark to tell"), Unclassified);
        assert_eq!(classify("another mother"), Unclassified);
        assert_eq!(classify(""), Unclassified);
    }

    #[test]
    fn continuous_duration_counts_from_first_of_run() {
        let t = tracker();
        let mut state = TrackerState::default();
        let mut last = 0;
        for (i, ts) in [0i64, 1_000, 2_000].into_iter().enumerate() {
            let out = t.observe(state, Work, ts);
            state = out.state;
            last = out.continuous_ms;
            if i == 0 {
                assert_eq!(out.continuous_ms, 0);
            }
        }
        assert_eq!(last, 2_000);

        let out = t.observe(state, Eating, 3_000);
        assert_eq!(out.continuous_ms, 0);
    }

    #[test]
    fn eating_wins_over_phone_when_both_hold() {
        let t = tracker();
        let mut state = TrackerState::default();
        state.counters.set(Eating, 2);
        state.counters.set(Phone, 1);
        let out = t.observe(state, Phone, 0);
        assert_eq!(out.instruction, Some(Instruction::Reminder(ReminderKind::Eating)));
    }

    #[test]
    fn cooled_down_category_falls_through_to_next() {
        let t = tracker();
        let mut state = TrackerState::default();
        state.counters.set(Eating, 5);
        let out = t.observe(state, Eating, 0);
        assert_eq!(out.instruction, Some(Instruction::Reminder(ReminderKind::Eating)));

        let out = t.observe(out.state, Phone, MIN);
        assert_eq!(out.instruction, Some(Instruction::Reminder(ReminderKind::Phone)));

        let out = t.observe(out.state, Work, 2 * MIN);
        assert_eq!(out.instruction, None);

        let out = t.observe(out.state, Work, 11 * MIN);
        assert_eq!(out.instruction, Some(Instruction::Reminder(ReminderKind::Eating)));
    }

    #[test]
    fn shared_cooldown_blocks_other_categories() {
        let mut cfg = tracker().config().clone();
        cfg.cooldown = CooldownPolicy::Shared;
        let t = BehaviorTracker::new(cfg);
        let mut state = TrackerState::default();
        state.counters.set(Eating, 5);
        let out = t.observe(state, Eating, 0);
        assert!(out.instruction.is_some());
        let out = t.observe(out.state, Phone, MIN);
        assert_eq!(out.instruction, None);
    }

    #[test]
    fn require_current_match_restores_strict_trigger() {
        let mut cfg = tracker().config().clone();
        cfg.require_current_match = true;
        let t = BehaviorTracker::new(cfg);
        let mut state = TrackerState::default();
        state.counters.set(Eating, 3);
        let out = t.observe(state, Phone, 0);
        assert_eq!(out.instruction, Some(Instruction::Reminder(ReminderKind::Phone)));
    }

    #[test]
    fn sitting_reminder_and_reset_on_away() {
        let t = tracker();
        let state = TrackerState::starting_at(0);
        let out = t.observe(state, Sleeping, 31 * MIN);
        assert_eq!(out.instruction, Some(Instruction::Reminder(ReminderKind::Sitting)));

        let out = t.observe(out.state, Other, 32 * MIN);
        assert_eq!(out.sitting_ms, 0);
        assert!(out.state.sitting_since_ms.is_none());

        let out = t.observe(out.state, Sleeping, 33 * MIN);
        assert_eq!(out.sitting_ms, 0);
        assert_eq!(out.state.sitting_since_ms, Some(33 * MIN));
    }

    #[test]
    fn encouragement_for_long_work_and_water() {
        let t = tracker();
        let out = t.observe(TrackerState::default(), Work, 0);
        assert_eq!(out.instruction, None);
        let out = t.observe(out.state, Work, 11 * MIN);
        assert_eq!(
            out.instruction,
            Some(Instruction::Encouragement(EncouragementKind::Work))
        );
        // same cooldown family
        let out = t.observe(out.state, DrinkingWater, 12 * MIN);
        assert_eq!(out.instruction, None);
        let out = t.observe(out.state, DrinkingWater, 22 * MIN);
        assert_eq!(
            out.instruction,
            Some(Instruction::Encouragement(EncouragementKind::Water))
        );
    }

    #[test]
    fn reminder_takes_precedence_over_encouragement() {
        let t = tracker();
        let mut state = TrackerState::default();
        state.counters.set(Phone, 1);
        let out = t.observe(state, DrinkingWater, 0);
        assert_eq!(out.instruction, Some(Instruction::Reminder(ReminderKind::Phone)));
        assert_eq!(out.state.reminders.last_fired(CooldownKey::Encouragement), None);
    }

    #[test]
    fn counters_never_shrink() {
        let t = tracker();
        let mut state = TrackerState::default();
        for (i, code) in [Work, Eating, Work, Other, Unclassified].into_iter().enumerate() {
            let before = state.counters.total();
            state = t.observe(state, code, i as i64 * MIN).state;
            assert_eq!(state.counters.total(), before + 1);
        }
        assert_eq!(state.counters.get(Work), 2);
        assert_eq!(state.counters.get(Unclassified), 1);
    }
}
