use super::observations::{ObservationLog, Recall};
use crate::behavior::{BehaviorCode, BehaviorCounters, EncouragementKind, Instruction, ReminderKind};
use crate::utils::truncate_chars;
use chrono::{Local, TimeZone};
use std::fmt::Write as _;

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an assistant that supervises a person's working state and helps them keep \
productive, healthy habits.

1. Observed behavior falls into these categories; respond accordingly:
   - focused work: encourage and praise the focus
   - drinking water: approve and encourage drinking more water
   - eating: criticize firmly, no snacking during work time
   - drinking a beverage (not water): criticize, suggest switching to water
   - using the phone: criticize very firmly, put the phone down now
   - sleeping: call it out, suggest standing up or drinking water
   - other: judge by whether it helps the work
2. Warm tone for positive behavior, direct and stern tone for negative behavior.
3. Keep every reply under 30 words.
4. When the user asks about their own behavior, answer only from the statistics and \
history provided. Never guess.";

const RECENT_IN_SUMMARY: usize = 5;
const RECENT_BRIEF_CHARS: usize = 100;
const RELEVANT_BRIEF_CHARS: usize = 150;

pub fn instruction_text(instruction: Option<Instruction>, code: BehaviorCode) -> String {
    let fixed = match instruction {
        Some(Instruction::Reminder(ReminderKind::Eating)) => {
            "The user keeps snacking. Criticize sternly and remind them not to eat during \
             work time; it hurts focus and health."
        }
        Some(Instruction::Reminder(ReminderKind::Beverage)) => {
            "The user often drinks beverages other than water. Criticize and suggest \
             fewer sugary drinks, water instead."
        }
        Some(Instruction::Reminder(ReminderKind::Phone)) => {
            "The user is on the phone. Criticize very firmly and demand they put it \
             down and get back to work."
        }
        Some(Instruction::Reminder(ReminderKind::Sitting)) => {
            "The user has been sitting for more than 30 minutes. Remind them to stand \
             up and move around."
        }
        Some(Instruction::Encouragement(EncouragementKind::Work)) => {
            "The user has been working for a while. Praise the focus and effort."
        }
        Some(Instruction::Encouragement(EncouragementKind::Water)) => {
            "The user is drinking water. Approve and encourage drinking more water."
        }
        None => {
            return format!(
                "React to the detected behavior '{}'. Encourage work or drinking water; \
                 criticize and remind for eating, phone use, beverages or sleeping.",
                code.description()
            )
        }
    };
    fixed.to_string()
}

/// User turn for a vision observation.
pub fn vision_turn(analysis: &str, instruction: Option<Instruction>, code: BehaviorCode) -> String {
    format!(
        "Observation: {}\n\n{}",
        analysis,
        instruction_text(instruction, code)
    )
}

/// Text that replaces a capture placeholder once analysis arrives.
pub fn vision_display_text(analysis: &str) -> String {
    format!("📷 {}", analysis)
}

/// What an utterance asks about, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorQuery {
    About(BehaviorCode),
    /// "What did I do?" style question without a specific behavior.
    Activity,
}

const BEVERAGE_PHRASES: &[&str] = &[
    "有没有喝饮料",
    "喝饮料了吗",
    "喝了什么",
    "喝过饮料",
    "any beverage",
    "any soda",
    "drink anything",
    "what did i drink",
    "had a drink",
];
const EATING_PHRASES: &[&str] = &[
    "有没有吃东西",
    "吃东西了吗",
    "吃了什么",
    "吃过东西",
    "did i eat",
    "have i eaten",
    "eaten anything",
    "what did i eat",
];
const PHONE_PHRASES: &[&str] = &[
    "有没有玩手机",
    "玩手机了吗",
    "用过手机",
    "my phone",
    "use the phone",
    "used the phone",
    "on the phone",
];
const ACTIVITY_PHRASES: &[&str] = &["我做了什么", "what did i do", "what have i been doing"];

/// Keyword detection in fixed order: beverage, eating, phone, activity.
pub fn detect_query(text: &str) -> Option<BehaviorQuery> {
    let lowered = text.to_lowercase();
    let hit = |phrases: &[&str]| phrases.iter().any(|p| lowered.contains(p));
    if hit(BEVERAGE_PHRASES) {
        Some(BehaviorQuery::About(BehaviorCode::DrinkingBeverage))
    } else if hit(EATING_PHRASES) {
        Some(BehaviorQuery::About(BehaviorCode::Eating))
    } else if hit(PHONE_PHRASES) {
        Some(BehaviorQuery::About(BehaviorCode::Phone))
    } else if hit(ACTIVITY_PHRASES) {
        Some(BehaviorQuery::Activity)
    } else {
        None
    }
}

fn clock(ts_ms: i64) -> String {
    Local
        .timestamp_millis_opt(ts_ms)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string())
}

/// Read-only view of the router's state used for a voice turn.
pub struct VoiceContext<'a> {
    pub counters: &'a BehaviorCounters,
    pub observations: &'a ObservationLog,
    pub sitting_ms: i64,
}

/// Lines describing what is known about `code`.
pub fn recall_lines(code: BehaviorCode, ctx: &VoiceContext<'_>) -> Vec<String> {
    match ctx.observations.recall(code, ctx.counters) {
        Recall::Records(records) => records
            .iter()
            .map(|o| {
                format!(
                    "- {}: {} - {}",
                    clock(o.timestamp_ms),
                    o.description,
                    truncate_chars(&o.raw_text, RELEVANT_BRIEF_CHARS)
                )
            })
            .collect(),
        Recall::FromCounters { code, count } => vec![format!(
            "'{}' was recorded {} time(s) today (from counters; details no longer in history)",
            code.description(),
            count
        )],
        Recall::NoRecord(code) => vec![format!(
            "No '{}' record found in history",
            code.description()
        )],
    }
}

pub fn context_summary(query: Option<BehaviorQuery>, ctx: &VoiceContext<'_>) -> String {
    let asked = match query {
        Some(BehaviorQuery::About(code)) => Some(code),
        _ => None,
    };

    let mut out = String::from("Current behavior statistics:\n");
    for code in BehaviorCode::CATEGORIES {
        let marker = if asked == Some(code) {
            " (the user is asking about this)"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "- {}: {} time(s){}",
            code.description(),
            ctx.counters.get(code),
            marker
        );
    }
    let _ = writeln!(out, "- sitting: {} minute(s)", ctx.sitting_ms.max(0) / 60_000);

    if let Some(code) = asked {
        out.push_str("\nRelevant behavior history:\n");
        for line in recall_lines(code, ctx) {
            out.push_str(&line);
            out.push('\n');
        }
    }

    out.push_str("\nRecent observations:\n");
    if ctx.observations.is_empty() {
        out.push_str("No recent observations\n");
    } else {
        for o in ctx.observations.recent(RECENT_IN_SUMMARY) {
            let _ = writeln!(
                out,
                "- {}: {} - {}",
                clock(o.timestamp_ms),
                o.description,
                truncate_chars(&o.raw_text, RECENT_BRIEF_CHARS)
            );
        }
    }

    match ctx.observations.last() {
        Some(last) => {
            let _ = write!(
                out,
                "\nLast observation ({}):\n{}",
                clock(last.timestamp_ms),
                last.raw_text
            );
        }
        None => out.push_str("\nNo observations yet"),
    }
    out
}

/// User turn for a transcribed utterance.
pub fn voice_turn(utterance: &str, ctx: &VoiceContext<'_>) -> String {
    let summary = context_summary(detect_query(utterance), ctx);
    format!("{}\n\nUser said: {}", summary, utterance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BehaviorObservation;

    #[test]
    fn detects_queries_in_both_languages() {
        assert_eq!(
            detect_query("我今天有没有喝饮料？"),
            Some(BehaviorQuery::About(BehaviorCode::DrinkingBeverage))
        );
        assert_eq!(
            detect_query("Did I eat anything this morning?"),
            Some(BehaviorQuery::About(BehaviorCode::Eating))
        );
        assert_eq!(
            detect_query("was I on the phone"),
            Some(BehaviorQuery::About(BehaviorCode::Phone))
        );
        assert_eq!(detect_query("我做了什么"), Some(BehaviorQuery::Activity));
        assert_eq!(detect_query("tell me a joke"), None);
    }

    #[test]
    fn eating_query_with_empty_history_uses_counters() {
        let mut counters = BehaviorCounters::default();
        counters.set(BehaviorCode::Eating, 3);
        let observations = ObservationLog::default();
        let ctx = VoiceContext {
            counters: &counters,
            observations: &observations,
            sitting_ms: 0,
        };
        let turn = voice_turn("did I eat anything?", &ctx);
        assert!(turn.contains("recorded 3 time(s) today (from counters"));
        assert!(!turn.contains("No 'eating' record found"));
        assert!(turn.ends_with("User said: did I eat anything?"));
    }

    #[test]
    fn summary_lists_recent_and_last_observation() {
        let counters = BehaviorCounters::default();
        let mut observations = ObservationLog::default();
        for i in 0..7 {
            observations.push(BehaviorObservation::new(
                i * 1000,
                BehaviorCode::Work,
                format!("typing {i} {}", "x".repeat(200)),
            ));
        }
        let ctx = VoiceContext {
            counters: &counters,
            observations: &observations,
            sitting_ms: 125 * 60_000,
        };
        let summary = context_summary(None, &ctx);
        assert_eq!(summary.matches("focused work - typing").count(), 5);
        assert!(!summary.contains("typing 1 "));
        assert!(summary.contains("sitting: 125 minute(s)"));
        assert!(summary.contains("Last observation ("));
        assert!(summary.contains("typing 6"));
        assert!(!summary.contains("Relevant behavior history"));
    }

    #[test]
    fn vision_turn_carries_instruction() {
        let turn = vision_turn(
            "5. using the phone",
            Some(Instruction::Reminder(ReminderKind::Phone)),
            BehaviorCode::Phone,
        );
        assert!(turn.starts_with("Observation: 5. using the phone\n\n"));
        assert!(turn.contains("put it"));
        let generic = vision_turn("1. focused work", None, BehaviorCode::Work);
        assert!(generic.contains("'focused work'"));
    }
}
