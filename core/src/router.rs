// Event router: the single consumer of analysis events
//
// Owns the conversation history, the observation log and the tracker state.
// Nothing else writes them; observers get copies through the snapshot
// channel.

use crate::behavior::{BehaviorCode, BehaviorCounters, BehaviorTracker, Instruction, TrackerState};
use crate::collab::{PresentationSink, PresentedMessage, ReplyGenerator, Speaker};
use crate::context::prompts::{self, VoiceContext};
use crate::context::{
    BehaviorObservation, ChatMessage, ConversationHistory, ObservationLog, DEFAULT_HISTORY_CAP,
    DEFAULT_SYSTEM_PROMPT, MIN_OBSERVATIONS,
};
use crate::event::{AnalysisEvent, EventQueue, Priority, VisionAnalysis, VoiceInput};
use crate::journal::BehaviorJournal;
use crate::speech::SpeechOutput;
use crate::utils::now_ms;
use crate::{Result, VigilError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub system_prompt: String,
    pub history_cap: usize,
    pub observation_cap: usize,
    pub reply_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_cap: std::env::var("ROUTER_HISTORY_CAP")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(DEFAULT_HISTORY_CAP),
            observation_cap: std::env::var("ROUTER_OBSERVATION_CAP")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(MIN_OBSERVATIONS),
            reply_timeout: Duration::from_millis(
                std::env::var("REPLY_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(30_000),
            ),
        }
    }
}

/// Copy of the router's state after the last handled event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterSnapshot {
    pub vision_routed: u64,
    pub voice_routed: u64,
    pub failed: u64,
    pub counters: BehaviorCounters,
    pub observations: usize,
    pub last_code: Option<BehaviorCode>,
    pub last_instruction: Option<Instruction>,
    pub history_len: usize,
    pub sitting_ms: i64,
}

pub struct EventRouter {
    queue: EventQueue,
    tracker: BehaviorTracker,
    state: TrackerState,
    observations: ObservationLog,
    history: ConversationHistory,
    journal: Option<BehaviorJournal>,
    reply: Arc<dyn ReplyGenerator>,
    speech: Arc<dyn SpeechOutput>,
    presentation: Arc<dyn PresentationSink>,
    cfg: RouterConfig,
    snapshot: RouterSnapshot,
    snapshot_tx: watch::Sender<RouterSnapshot>,
}

impl EventRouter {
    pub fn new(
        queue: EventQueue,
        tracker: BehaviorTracker,
        reply: Arc<dyn ReplyGenerator>,
        speech: Arc<dyn SpeechOutput>,
        presentation: Arc<dyn PresentationSink>,
        cfg: RouterConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(RouterSnapshot::default());
        Self {
            queue,
            tracker,
            state: TrackerState::starting_at(now_ms()),
            observations: ObservationLog::new(cfg.observation_cap),
            history: ConversationHistory::new(cfg.system_prompt.clone(), cfg.history_cap),
            journal: None,
            reply,
            speech,
            presentation,
            cfg,
            snapshot: RouterSnapshot::default(),
            snapshot_tx,
        }
    }

    pub fn with_journal(mut self, journal: BehaviorJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Replace the tracker state, e.g. to start the sitting clock at a
    /// known time.
    pub fn with_tracker_state(mut self, state: TrackerState) -> Self {
        self.state = state;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<RouterSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        self.snapshot.clone()
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn observations(&self) -> &ObservationLog {
        &self.observations
    }

    pub fn tracker_state(&self) -> &TrackerState {
        &self.state
    }

    /// Spawn the consumer loop. It drains the queue until it is closed or
    /// `cancel` fires.
    pub fn start(mut self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let handle = tokio::spawn(async move {
            info!(target = "router", "Event router started");
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = self.queue.recv() => item,
                };
                let Some(item) = item else { break };
                debug!(target = "router", seq = item.seq, priority = item.priority.as_u8(), kind = ?item.event.kind(), "Routing event");
                if let Err(e) = self.handle_event(item.event).await {
                    warn!(target = "router", seq = item.seq, error = %e, "Event handling failed");
                }
            }
            info!(target = "router", "Event router stopped");
        });
        Ok(handle)
    }

    /// Handle one event to completion. Errors are reported as status and
    /// returned; the router stays usable.
    pub async fn handle_event(&mut self, event: AnalysisEvent) -> Result<()> {
        let result = match event {
            AnalysisEvent::Vision(v) => {
                self.snapshot.vision_routed += 1;
                self.handle_vision(v).await
            }
            AnalysisEvent::Voice(v) => {
                self.snapshot.voice_routed += 1;
                self.handle_voice(v).await
            }
        };
        if let Err(e) = &result {
            self.snapshot.failed += 1;
            self.presentation
                .push_status(&format!("Reply generation failed: {e}"));
        }
        self.publish_snapshot();
        result
    }

    async fn handle_vision(&mut self, v: VisionAnalysis) -> Result<()> {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(v.timestamp_ms, v.code, &v.text).await {
                error!(target = "router", error = %e, "Behavior journal append failed");
            }
        }

        self.observations
            .push(BehaviorObservation::new(v.timestamp_ms, v.code, v.text.clone()));

        let state = std::mem::take(&mut self.state);
        let observed = self.tracker.observe(state, v.code, v.timestamp_ms);
        self.state = observed.state;
        self.snapshot.last_instruction = observed.instruction;
        if let Some(instruction) = observed.instruction {
            info!(target = "router", template = instruction.template_key(), code = v.code.number(), "Feedback triggered");
        }

        let display = prompts::vision_display_text(&v.text);
        match &v.placeholder_id {
            Some(id) => self.presentation.resolve_placeholder(id, &display),
            None => self.presentation.push_message(
                PresentedMessage::new(Speaker::User, display).with_image(v.display_frame.clone()),
            ),
        }

        self.history.push(ChatMessage::user(prompts::vision_turn(
            &v.text,
            observed.instruction,
            v.code,
        )));
        let reply = self.generate().await?;
        self.presentation
            .push_message(PresentedMessage::new(Speaker::Assistant, reply.clone()));

        // Routine observations are shown but not spoken.
        if observed.instruction.is_some() {
            self.speech.speak(&reply, Priority::Normal);
        }
        Ok(())
    }

    async fn handle_voice(&mut self, v: VoiceInput) -> Result<()> {
        self.speech.skip();

        match &v.placeholder_id {
            Some(id) => self.presentation.resolve_placeholder(id, &v.text),
            None => self
                .presentation
                .push_message(PresentedMessage::new(Speaker::User, v.text.clone())),
        }

        let ctx = VoiceContext {
            counters: &self.state.counters,
            observations: &self.observations,
            sitting_ms: self.state.sitting_ms(v.timestamp_ms),
        };
        let turn = prompts::voice_turn(&v.text, &ctx);
        self.history.push(ChatMessage::user(turn));

        let reply = self.generate().await?;
        self.presentation
            .push_message(PresentedMessage::new(Speaker::Assistant, reply.clone()));
        self.speech.speak(&reply, Priority::Interrupt);
        Ok(())
    }

    async fn generate(&mut self) -> Result<String> {
        let messages = self.history.messages();
        let reply = timeout(self.cfg.reply_timeout, self.reply.generate_reply(&messages))
            .await
            .map_err(|_| VigilError::Collaborator("reply generation timed out".into()))??;
        self.history.push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }

    fn publish_snapshot(&mut self) {
        self.snapshot.counters = self.state.counters.clone();
        self.snapshot.observations = self.observations.len();
        self.snapshot.last_code = self.state.last_code;
        self.snapshot.history_len = self.history.len();
        self.snapshot.sitting_ms = self.state.sitting_ms(now_ms());
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }
}
