//! Conversation and observation context owned by the router.

mod history;
mod observations;
pub mod prompts;

pub use history::{ChatMessage, ConversationHistory, Role, DEFAULT_HISTORY_CAP};
pub use observations::{
    BehaviorObservation, ObservationLog, Recall, MAX_OBSERVATIONS, MIN_OBSERVATIONS,
};
pub use prompts::{detect_query, BehaviorQuery, VoiceContext, DEFAULT_SYSTEM_PROMPT};
