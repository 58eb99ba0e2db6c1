//! Conversation sessions and the engine that drives them.
//!
//! A session is `Active` until the collaborator signals a breakup (or an
//! unanswered follow-up fires for a profile that ends on silence), after
//! which it is `Ended` for good. All mutation happens under the session's
//! lock, so messages land in the order they were confirmed.

pub mod message;
pub mod timer;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::agent::{EngineResponse, ReasoningCollaborator, ReasoningRequest, UnparsableReply};
use crate::character::{CharacterProfile, ProfileStore, Reaction};
use crate::error::ChatError;
use message::{Message, Sender as MessageSender};
use timer::ScheduledTimer;

pub const SEED_MESSAGE_ID: u64 = 1;

/// Knobs the engine applies to every session.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// Discard a malformed response and ask once more before failing the turn.
    pub retry_malformed_responses: bool,
    /// Upper bound for any delay requested by the collaborator.
    pub max_delay: Duration,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            retry_malformed_responses: false,
            max_delay: Duration::from_secs(120),
        }
    }
}

impl EnginePolicy {
    fn clamp(&self, delay: Duration) -> Duration {
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    BrokeUp,
    Silence,
}

/// Things that happened to a session, pushed to observers such as the
/// WebSocket bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    MessageAppended {
        session_id: String,
        message: Message,
    },
    TurnFailed {
        session_id: String,
        error_kind: String,
        error: String,
    },
    FollowUpArmed {
        session_id: String,
        fires_in_ms: u64,
    },
    Ended {
        session_id: String,
        reason: EndReason,
    },
    Reset {
        session_id: String,
    },
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::MessageAppended { .. } => "message_appended",
            SessionEvent::TurnFailed { .. } => "turn_failed",
            SessionEvent::FollowUpArmed { .. } => "follow_up_armed",
            SessionEvent::Ended { .. } => "ended",
            SessionEvent::Reset { .. } => "reset",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::MessageAppended { session_id, .. }
            | SessionEvent::TurnFailed { session_id, .. }
            | SessionEvent::FollowUpArmed { session_id, .. }
            | SessionEvent::Ended { session_id, .. }
            | SessionEvent::Reset { session_id } => session_id,
        }
    }
}

/// Result of a successful `submit_user_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The character's messages were appended.
    Delivered {
        messages: Vec<Message>,
        ended: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        follow_up_in_ms: Option<u64>,
    },
    /// A valid reply is waiting out its pre-send delay; the messages arrive
    /// as events.
    Scheduled { deliver_in_ms: u64 },
    /// The session was reset while the reply was being produced.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpView {
    pub message: String,
    pub due_at: DateTime<Utc>,
}

/// Read-only copy of a session's observable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub character_id: String,
    pub typing_label: String,
    pub transcript: Vec<Message>,
    pub ended: bool,
    pub awaiting_reply: bool,
    pub escalation_level: u32,
    pub internal_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_follow_up: Option<FollowUpView>,
}

struct EngineContext {
    collaborator: Arc<dyn ReasoningCollaborator>,
    policy: EnginePolicy,
    events: Sender<SessionEvent>,
}

impl EngineContext {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("No session event listeners attached");
        }
    }
}

/// Creates sessions bound to a profile store and a reasoning collaborator.
#[derive(Clone)]
pub struct ConversationEngine {
    store: Arc<ProfileStore>,
    ctx: Arc<EngineContext>,
}

impl ConversationEngine {
    pub fn new(
        store: Arc<ProfileStore>,
        collaborator: Arc<dyn ReasoningCollaborator>,
        policy: EnginePolicy,
        events: Sender<SessionEvent>,
    ) -> Self {
        Self {
            store,
            ctx: Arc::new(EngineContext {
                collaborator,
                policy,
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    pub fn collaborator_name(&self) -> &str {
        self.ctx.collaborator.name()
    }

    /// Open a new session seeded with the character's opening line.
    pub fn start(&self, character_id: &str) -> Result<SessionHandle, ChatError> {
        let profile = self
            .store
            .get(character_id)
            .ok_or_else(|| ChatError::ProfileNotFound(character_id.trim().to_string()))?;

        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!("Starting session {} with {}", id, profile.id);
        let state = SessionState::seeded(id.clone(), profile);

        Ok(SessionHandle {
            id,
            inner: Arc::new(Mutex::new(state)),
            ctx: self.ctx.clone(),
        })
    }
}

struct PendingFollowUp {
    timer: ScheduledTimer,
    message: String,
    due_at: DateTime<Utc>,
}

struct SessionState {
    id: String,
    profile: Arc<CharacterProfile>,
    transcript: Vec<Message>,
    next_message_id: u64,
    next_timer_id: u64,
    /// Bumped by reset and close; replies from an older generation are dropped.
    generation: u64,
    ended: bool,
    in_flight: bool,
    internal_state: String,
    escalation_level: u32,
    follow_up: Option<PendingFollowUp>,
    delivery: Option<ScheduledTimer>,
}

impl SessionState {
    fn seeded(id: String, profile: Arc<CharacterProfile>) -> Self {
        let mut state = Self {
            id,
            profile,
            transcript: Vec::new(),
            next_message_id: SEED_MESSAGE_ID,
            next_timer_id: 1,
            generation: 0,
            ended: false,
            in_flight: false,
            internal_state: String::new(),
            escalation_level: 0,
            follow_up: None,
            delivery: None,
        };
        state.reseed();
        state
    }

    fn reseed(&mut self) {
        self.cancel_timers();
        self.generation += 1;
        self.transcript.clear();
        self.next_message_id = SEED_MESSAGE_ID;
        self.ended = false;
        self.in_flight = false;
        self.escalation_level = 0;
        self.internal_state = self.profile.internal_state.describe();
        let opening = self.profile.opening_line.clone();
        self.push(MessageSender::Character, opening);
    }

    fn push(&mut self, sender: MessageSender, content: String) -> &Message {
        let message = Message::new(self.next_message_id, sender, content);
        self.next_message_id += 1;
        self.transcript.push(message);
        &self.transcript[self.transcript.len() - 1]
    }

    fn next_timer_id(&mut self) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        id
    }

    fn cancel_follow_up(&mut self) {
        if let Some(pending) = self.follow_up.take() {
            tracing::debug!("Session {}: cancelled pending follow-up", self.id);
            pending.timer.cancel();
        }
    }

    fn cancel_timers(&mut self) {
        self.cancel_follow_up();
        if let Some(delivery) = self.delivery.take() {
            delivery.cancel();
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            character_id: self.profile.id.clone(),
            typing_label: self.profile.typing_label(),
            transcript: self.transcript.clone(),
            ended: self.ended,
            awaiting_reply: self.in_flight,
            escalation_level: self.escalation_level,
            internal_state: self.internal_state.clone(),
            pending_follow_up: self.follow_up.as_ref().map(|f| FollowUpView {
                message: f.message.clone(),
                due_at: f.due_at,
            }),
        }
    }
}

/// Shared handle to one conversation. Cloning the handle does not fork the
/// conversation.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    inner: Arc<Mutex<SessionState>>,
    ctx: Arc<EngineContext>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().await.snapshot()
    }

    pub async fn transcript(&self) -> Vec<Message> {
        self.inner.lock().await.transcript.clone()
    }

    pub async fn is_ended(&self) -> bool {
        self.inner.lock().await.ended
    }

    /// Append the user's message and run one turn against the collaborator.
    ///
    /// The turn runs on a task owned by the session, so it resolves (and
    /// clears the in-flight flag) even if the caller stops waiting.
    pub async fn submit_user_message(&self, text: &str) -> Result<TurnOutcome, ChatError> {
        let (request, generation) = {
            let mut state = self.inner.lock().await;
            if state.ended {
                return Err(ChatError::SessionEnded);
            }
            let content = text.trim();
            if content.is_empty() {
                return Err(ChatError::EmptyInput);
            }
            if state.in_flight {
                return Err(ChatError::RequestInFlight);
            }

            state.cancel_follow_up();
            let message = state.push(MessageSender::User, content.to_string()).clone();
            state.in_flight = true;
            self.ctx.emit(SessionEvent::MessageAppended {
                session_id: self.id.clone(),
                message,
            });

            let request = ReasoningRequest {
                transcript: state.transcript.clone(),
                profile: state.profile.clone(),
                internal_state: state.internal_state.clone(),
            };
            (request, state.generation)
        };

        let session = self.clone();
        let turn = tokio::spawn(async move { session.run_turn(request, generation).await });
        match turn.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                tracing::error!("Session {}: turn task failed: {}", self.id, join_error);
                let mut state = self.inner.lock().await;
                if state.generation == generation {
                    state.in_flight = false;
                }
                Err(ChatError::ReasoningUnavailable(
                    "reply task stopped before finishing".to_string(),
                ))
            }
        }
    }

    async fn run_turn(
        &self,
        request: ReasoningRequest,
        generation: u64,
    ) -> Result<TurnOutcome, ChatError> {
        let result = self.request_response(&request).await;

        let mut state = self.inner.lock().await;
        if state.generation != generation {
            tracing::debug!(
                "Session {}: dropping reply for superseded generation {}",
                self.id,
                generation
            );
            return Ok(TurnOutcome::Superseded);
        }

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                state.in_flight = false;
                self.ctx.emit(SessionEvent::TurnFailed {
                    session_id: self.id.clone(),
                    error_kind: error.kind().to_string(),
                    error: error.to_string(),
                });
                return Err(error);
            }
        };

        let send_delay = self.ctx.policy.clamp(response.send_delay);
        if send_delay.is_zero() {
            let delivered = deliver(&mut state, response, &self.inner, &self.ctx);
            return Ok(delivered);
        }

        tracing::debug!(
            "Session {}: holding {} message(s) for {:?}",
            self.id,
            response.queued_messages.len(),
            send_delay
        );
        let timer_id = state.next_timer_id();
        let inner = self.inner.clone();
        let ctx = self.ctx.clone();
        let timer = ScheduledTimer::spawn(timer_id, send_delay, async move {
            let mut state = inner.lock().await;
            if state.generation != generation
                || state.delivery.as_ref().map(ScheduledTimer::id) != Some(timer_id)
            {
                return;
            }
            state.delivery = None;
            deliver(&mut state, response, &inner, &ctx);
        });
        state.delivery = Some(timer);

        Ok(TurnOutcome::Scheduled {
            deliver_in_ms: send_delay.as_millis() as u64,
        })
    }

    /// Discard the conversation and start over from the opening line. Any
    /// reply still being produced is ignored when it arrives.
    pub async fn reset(&self) -> SessionSnapshot {
        let mut state = self.inner.lock().await;
        state.reseed();
        tracing::info!("Session {} reset", self.id);
        self.ctx.emit(SessionEvent::Reset {
            session_id: self.id.clone(),
        });
        state.snapshot()
    }

    /// Cancel timers and invalidate outstanding replies before the handle is
    /// discarded.
    pub async fn close(&self) {
        let mut state = self.inner.lock().await;
        state.cancel_timers();
        state.generation += 1;
        state.in_flight = false;
        tracing::info!("Session {} closed", self.id);
    }

    async fn request_response(&self, request: &ReasoningRequest) -> Result<EngineResponse, ChatError> {
        let collaborator = &self.ctx.collaborator;
        let mut attempts_left = if self.ctx.policy.retry_malformed_responses {
            2
        } else {
            1
        };

        loop {
            attempts_left -= 1;
            let validated = match collaborator.respond(request).await {
                Ok(raw) => {
                    tracing::debug!(
                        "Session {}: raw reply from {}: {}",
                        self.id,
                        collaborator.name(),
                        raw
                    );
                    EngineResponse::from_contract(&request.profile.response_contract, &raw)
                }
                Err(e) => match e.downcast_ref::<UnparsableReply>() {
                    Some(unparsable) => Err(ChatError::MalformedResponse(vec![unparsable.to_string()])),
                    None => {
                        tracing::error!(
                            "Session {}: {} failed to respond: {:#}",
                            self.id,
                            collaborator.name(),
                            e
                        );
                        return Err(ChatError::ReasoningUnavailable(format!("{:#}", e)));
                    }
                },
            };

            match validated {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::warn!("Session {}: {}", self.id, error);
                    if attempts_left == 0 {
                        return Err(error);
                    }
                    tracing::info!("Session {}: retrying malformed reply once", self.id);
                }
            }
        }
    }
}

/// Apply a validated reply: update disposition, append the queued messages,
/// then either end the session or arm the follow-up.
fn deliver(
    state: &mut SessionState,
    response: EngineResponse,
    inner: &Arc<Mutex<SessionState>>,
    ctx: &Arc<EngineContext>,
) -> TurnOutcome {
    state.in_flight = false;
    let follow_up_after = ctx.policy.clamp(response.follow_up_after());
    if let Some(next) = response.new_internal_state {
        state.internal_state = next;
    }
    if response.is_state_progression {
        state.escalation_level += 1;
    }

    let mut reactions = std::collections::BTreeMap::new();
    for (key, reaction) in response.message_reactions {
        if reacts_to_existing(&state.transcript, &key) {
            reactions.insert(key, reaction);
        } else {
            tracing::debug!(
                "Session {}: dropping {} reaction for unknown message '{}'",
                state.id,
                reaction,
                key
            );
        }
    }

    let mut delivered: Vec<Message> = Vec::with_capacity(response.queued_messages.len());
    for text in response.queued_messages {
        state.push(MessageSender::Character, text);
        let Some(message) = state.transcript.last_mut() else {
            continue;
        };
        if delivered.is_empty() {
            message.reactions = std::mem::take(&mut reactions);
        }
        let message = message.clone();
        ctx.emit(SessionEvent::MessageAppended {
            session_id: state.id.clone(),
            message: message.clone(),
        });
        delivered.push(message);
    }

    if response.break_up_with_user {
        state.ended = true;
        tracing::info!("Session {}: {} ended the conversation", state.id, state.profile.id);
        ctx.emit(SessionEvent::Ended {
            session_id: state.id.clone(),
            reason: EndReason::BrokeUp,
        });
        return TurnOutcome::Delivered {
            messages: delivered,
            ended: true,
            follow_up_in_ms: None,
        };
    }

    let mut follow_up_in_ms = None;
    if let Some(text) = response.follow_up_message {
        arm_follow_up(state, inner, ctx, follow_up_after, text);
        follow_up_in_ms = Some(follow_up_after.as_millis() as u64);
    }

    TurnOutcome::Delivered {
        messages: delivered,
        ended: false,
        follow_up_in_ms,
    }
}

fn reacts_to_existing(transcript: &[Message], key: &str) -> bool {
    key.trim()
        .parse::<u64>()
        .map(|id| transcript.iter().any(|m| m.id == id))
        .unwrap_or(false)
}

fn arm_follow_up(
    state: &mut SessionState,
    inner: &Arc<Mutex<SessionState>>,
    ctx: &Arc<EngineContext>,
    after: Duration,
    message: String,
) {
    state.cancel_follow_up();
    let timer_id = state.next_timer_id();
    let generation = state.generation;
    let task_inner = inner.clone();
    let task_ctx = ctx.clone();
    let timer = ScheduledTimer::spawn(timer_id, after, async move {
        let mut state = task_inner.lock().await;
        fire_follow_up(&mut state, &task_ctx, timer_id, generation);
    });

    let fires_in = timer.fires_in();
    let due_at = Utc::now()
        + chrono::Duration::from_std(fires_in).unwrap_or_else(|_| chrono::Duration::zero());
    state.follow_up = Some(PendingFollowUp {
        timer,
        message,
        due_at,
    });
    ctx.emit(SessionEvent::FollowUpArmed {
        session_id: state.id.clone(),
        fires_in_ms: fires_in.as_millis() as u64,
    });
}

fn fire_follow_up(state: &mut SessionState, ctx: &EngineContext, timer_id: u64, generation: u64) {
    let is_current = state.generation == generation
        && state.follow_up.as_ref().map(|f| f.timer.id()) == Some(timer_id);
    if !is_current || state.ended || state.in_flight {
        return;
    }
    let Some(pending) = state.follow_up.take() else {
        return;
    };

    let message = state.push(MessageSender::Character, pending.message).clone();
    tracing::info!("Session {}: follow-up sent after silence", state.id);
    ctx.emit(SessionEvent::MessageAppended {
        session_id: state.id.clone(),
        message,
    });

    if state.profile.ends_on_silence {
        state.ended = true;
        ctx.emit(SessionEvent::Ended {
            session_id: state.id.clone(),
            reason: EndReason::Silence,
        });
    }
}

/// Reaction attached to a given message, if any.
pub fn reaction_for(message: &Message, target_id: u64) -> Option<Reaction> {
    message.reactions.get(&target_id.to_string()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedReasoner;
    use crate::character::abby::{abby, ABBY_OPENING_LINE};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays canned replies in order, optionally after a delay.
    struct CannedReasoner {
        replies: std::sync::Mutex<VecDeque<Result<Value>>>,
        latency: Duration,
        calls: AtomicUsize,
    }

    impl CannedReasoner {
        fn new(replies: Vec<Result<Value>>) -> Self {
            Self {
                replies: std::sync::Mutex::new(replies.into()),
                latency: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }
    }

    #[async_trait]
    impl ReasoningCollaborator for CannedReasoner {
        fn name(&self) -> &str {
            "canned"
        }

        async fn respond(&self, _request: &ReasoningRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no canned reply left")))
        }
    }

    fn reply(queued: &[&str], break_up: bool) -> Value {
        json!({
            "newInternalState": "Abby is fuming.",
            "queuedMessages": queued,
            "breakUpWithUser": break_up,
            "isStateProgression": break_up,
            "messageReactions": {},
            "howLongToWaitToSendMessages": 0,
            "howLongToWaitAfterSendingToFollowUp": 0,
            "followUpMessage": "",
            "deadline": 0
        })
    }

    fn with_follow_up(mut value: Value, delay_ms: u64, deadline_ms: u64, text: &str) -> Value {
        value["howLongToWaitAfterSendingToFollowUp"] = json!(delay_ms);
        value["deadline"] = json!(deadline_ms);
        value["followUpMessage"] = json!(text);
        value
    }

    fn engine_with(
        collaborator: Arc<dyn ReasoningCollaborator>,
        policy: EnginePolicy,
    ) -> (ConversationEngine, flume::Receiver<SessionEvent>) {
        let (tx, rx) = flume::unbounded();
        let store = Arc::new(ProfileStore::builtin().unwrap());
        (ConversationEngine::new(store, collaborator, policy, tx), rx)
    }

    fn canned(replies: Vec<Result<Value>>) -> (ConversationEngine, flume::Receiver<SessionEvent>) {
        engine_with(Arc::new(CannedReasoner::new(replies)), EnginePolicy::default())
    }

    fn contents(transcript: &[Message]) -> Vec<&str> {
        transcript.iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn start_seeds_the_opening_line() {
        let (engine, _rx) = canned(vec![]);
        let session = engine.start("abby").unwrap();
        let snapshot = session.snapshot().await;
        assert_eq!(contents(&snapshot.transcript), vec![ABBY_OPENING_LINE]);
        assert_eq!(snapshot.transcript[0].id, SEED_MESSAGE_ID);
        assert!(snapshot.transcript[0].is_from_character());
        assert!(!snapshot.ended);
        assert_eq!(snapshot.internal_state, abby().internal_state.describe());
    }

    #[tokio::test]
    async fn unknown_character_is_not_found() {
        let (engine, _rx) = canned(vec![]);
        let err = engine.start("Zelda").err().unwrap();
        assert_eq!(err, ChatError::ProfileNotFound("Zelda".to_string()));
    }

    #[tokio::test]
    async fn blank_input_is_rejected_without_appending() {
        let (engine, _rx) = canned(vec![]);
        let session = engine.start("Abby").unwrap();
        for blank in ["", "   ", "\n\t"] {
            assert_eq!(
                session.submit_user_message(blank).await,
                Err(ChatError::EmptyInput)
            );
        }
        assert_eq!(session.transcript().await.len(), 1);
    }

    #[tokio::test]
    async fn breakup_ends_the_session_and_stays_ended() {
        let (engine, rx) = canned(vec![Ok(reply(&["Done.", "Bye forever."], true))]);
        let session = engine.start("Abby").unwrap();

        let outcome = session.submit_user_message("  hi there  ").await.unwrap();
        match outcome {
            TurnOutcome::Delivered {
                messages,
                ended,
                follow_up_in_ms,
            } => {
                assert_eq!(contents(&messages), vec!["Done.", "Bye forever."]);
                assert!(ended);
                assert!(follow_up_in_ms.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let snapshot = session.snapshot().await;
        assert!(snapshot.ended);
        assert!(snapshot.pending_follow_up.is_none());
        assert_eq!(snapshot.escalation_level, 1);
        assert_eq!(snapshot.internal_state, "Abby is fuming.");
        assert_eq!(snapshot.transcript[1].content, "hi there");
        assert!(snapshot.transcript.last().unwrap().is_from_character());

        assert_eq!(
            session.submit_user_message("wait").await,
            Err(ChatError::SessionEnded)
        );
        assert_eq!(session.transcript().await.len(), 4);

        let events: Vec<SessionEvent> = rx.drain().collect();
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Ended {
                reason: EndReason::BrokeUp,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_follow_up_fires_once_after_its_delay() {
        let value = with_follow_up(reply(&["Hello??"], false), 5_000, 10_000, "Wow. Silence.");
        let (engine, rx) = canned(vec![Ok(value)]);
        let session = engine.start("Abby").unwrap();

        let outcome = session.submit_user_message("what").await.unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::Delivered {
                follow_up_in_ms: Some(10_000),
                ..
            }
        ));
        assert!(session.snapshot().await.pending_follow_up.is_some());
        assert!(rx.drain().any(|event| matches!(
            event,
            SessionEvent::FollowUpArmed {
                fires_in_ms: 10_000,
                ..
            }
        )));

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert_eq!(session.transcript().await.len(), 3);

        tokio::time::sleep(Duration::from_millis(2)).await;
        let transcript = session.transcript().await;
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript[3].content, "Wow. Silence.");

        tokio::time::sleep(Duration::from_secs(60)).await;
        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.transcript.len(), 4);
        assert!(snapshot.pending_follow_up.is_none());
        // Abby treats silence after a follow-up as the end.
        assert!(snapshot.ended);
    }

    #[tokio::test(start_paused = true)]
    async fn follow_up_does_not_end_sessions_that_tolerate_silence() {
        let mut milo = abby();
        milo.id = "Milo".to_string();
        milo.ends_on_silence = false;
        let store = Arc::new(ProfileStore::from_profiles([milo]).unwrap());
        let value = with_follow_up(reply(&["Well?"], false), 1_000, 0, "Still there?");
        let (tx, _rx) = flume::unbounded();
        let engine = ConversationEngine::new(
            store,
            Arc::new(CannedReasoner::new(vec![Ok(value)])),
            EnginePolicy::default(),
            tx,
        );
        let session = engine.start("milo").unwrap();
        session.submit_user_message("hm").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.transcript.last().unwrap().content, "Still there?");
        assert!(!snapshot.ended);
    }

    #[tokio::test(start_paused = true)]
    async fn new_user_message_cancels_pending_follow_up() {
        let first = with_follow_up(reply(&["Hello??"], false), 5_000, 0, "Wow. Silence.");
        let second = reply(&["Whatever."], false);
        let (engine, _rx) = canned(vec![Ok(first), Ok(second)]);
        let session = engine.start("Abby").unwrap();

        session.submit_user_message("what").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        session.submit_user_message("I'm here").await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        let transcript = session.transcript().await;
        assert_eq!(
            contents(&transcript),
            vec![ABBY_OPENING_LINE, "what", "Hello??", "I'm here", "Whatever."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_follow_up_and_reseeds() {
        let value = with_follow_up(reply(&["Hello??"], false), 5_000, 0, "Wow. Silence.");
        let (engine, rx) = canned(vec![Ok(value)]);
        let session = engine.start("Abby").unwrap();
        session.submit_user_message("what").await.unwrap();

        let snapshot = session.reset().await;
        assert_eq!(contents(&snapshot.transcript), vec![ABBY_OPENING_LINE]);
        assert_eq!(snapshot.transcript[0].id, SEED_MESSAGE_ID);
        assert!(!snapshot.ended);
        assert!(snapshot.pending_follow_up.is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(session.transcript().await.len(), 1);
        assert!(rx
            .drain()
            .any(|event| matches!(event, SessionEvent::Reset { .. })));
    }

    #[tokio::test]
    async fn reset_revives_an_ended_session() {
        let (engine, _rx) = canned(vec![
            Ok(reply(&["Bye."], true)),
            Ok(reply(&["Ugh, fine."], false)),
        ]);
        let session = engine.start("Abby").unwrap();
        session.submit_user_message("hello").await.unwrap();
        assert!(session.is_ended().await);

        let snapshot = session.reset().await;
        assert!(!snapshot.ended);
        assert_eq!(snapshot.escalation_level, 0);
        assert!(session.submit_user_message("hi again").await.is_ok());
    }

    #[tokio::test]
    async fn malformed_reply_discards_the_turn() {
        let (engine, rx) = canned(vec![
            Ok(json!({ "queuedMessages": "not a list" })),
            Ok(reply(&["ok fine"], false)),
        ]);
        let session = engine.start("Abby").unwrap();

        let err = session.submit_user_message("hello").await.unwrap_err();
        assert_eq!(err.kind(), "malformed_response");

        let snapshot = session.snapshot().await;
        assert!(!snapshot.ended);
        assert!(!snapshot.awaiting_reply);
        assert_eq!(contents(&snapshot.transcript), vec![ABBY_OPENING_LINE, "hello"]);
        assert!(rx
            .drain()
            .any(|event| matches!(event, SessionEvent::TurnFailed { ref error_kind, .. } if error_kind == "malformed_response")));

        // The session is still usable.
        assert!(session.submit_user_message("hello?").await.is_ok());
    }

    #[tokio::test]
    async fn malformed_reply_is_retried_once_when_enabled() {
        let reasoner = Arc::new(CannedReasoner::new(vec![
            Ok(json!({ "queuedMessages": [] })),
            Ok(reply(&["Second try."], false)),
        ]));
        let policy = EnginePolicy {
            retry_malformed_responses: true,
            ..EnginePolicy::default()
        };
        let (engine, _rx) = engine_with(reasoner.clone(), policy);
        let session = engine.start("Abby").unwrap();

        let outcome = session.submit_user_message("hello").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Delivered { ref messages, .. } if messages[0].content == "Second try."));
        assert_eq!(reasoner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn collaborator_failure_is_reported_as_unavailable() {
        let (engine, _rx) = canned(vec![Err(anyhow::anyhow!("connection refused"))]);
        let session = engine.start("Abby").unwrap();
        let err = session.submit_user_message("hello").await.unwrap_err();
        assert!(matches!(err, ChatError::ReasoningUnavailable(ref m) if m.contains("connection refused")));
        assert!(!session.snapshot().await.awaiting_reply);
    }

    #[tokio::test]
    async fn prose_reply_is_malformed_and_retried() {
        let prose = || -> Result<Value> {
            Err(UnparsableReply("no JSON object in reply".to_string()).into())
        };
        let (engine, rx) = canned(vec![prose()]);
        let session = engine.start("Abby").unwrap();
        let err = session.submit_user_message("hello").await.unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
        assert!(rx
            .drain()
            .any(|event| matches!(event, SessionEvent::TurnFailed { ref error_kind, .. } if error_kind == "malformed_response")));

        let reasoner = Arc::new(CannedReasoner::new(vec![
            prose(),
            Ok(reply(&["ok I'm back."], false)),
        ]));
        let policy = EnginePolicy {
            retry_malformed_responses: true,
            ..EnginePolicy::default()
        };
        let (engine, _rx) = engine_with(reasoner.clone(), policy);
        let session = engine.start("Abby").unwrap();
        let outcome = session.submit_user_message("hello").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Delivered { ref messages, .. } if messages[0].content == "ok I'm back."));
        assert_eq!(reasoner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_submit_still_finishes_the_turn() {
        let reasoner = CannedReasoner::new(vec![
            Ok(reply(&["Whatever."], false)),
            Ok(reply(&["Still here."], false)),
        ])
        .slow(Duration::from_secs(2));
        let (engine, _rx) = engine_with(Arc::new(reasoner), EnginePolicy::default());
        let session = engine.start("Abby").unwrap();

        let caller = {
            let session = session.clone();
            tokio::spawn(async move { session.submit_user_message("one").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let snapshot = session.snapshot().await;
        assert!(!snapshot.awaiting_reply);
        assert_eq!(
            contents(&snapshot.transcript),
            vec![ABBY_OPENING_LINE, "one", "Whatever."]
        );
        assert!(session.submit_user_message("two").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submit_is_rejected_while_in_flight() {
        let reasoner = CannedReasoner::new(vec![Ok(reply(&["Finally."], false))])
            .slow(Duration::from_secs(2));
        let (engine, _rx) = engine_with(Arc::new(reasoner), EnginePolicy::default());
        let session = engine.start("Abby").unwrap();

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.submit_user_message("one").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(session.snapshot().await.awaiting_reply);
        assert_eq!(
            session.submit_user_message("two").await,
            Err(ChatError::RequestInFlight)
        );

        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, TurnOutcome::Delivered { .. }));
        assert_eq!(
            contents(&session.transcript().await),
            vec![ABBY_OPENING_LINE, "one", "Finally."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_while_in_flight_supersedes_the_reply() {
        let reasoner = CannedReasoner::new(vec![Ok(reply(&["Too late."], false))])
            .slow(Duration::from_secs(2));
        let (engine, _rx) = engine_with(Arc::new(reasoner), EnginePolicy::default());
        let session = engine.start("Abby").unwrap();

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.submit_user_message("hey").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.reset().await;

        assert_eq!(pending.await.unwrap(), Ok(TurnOutcome::Superseded));
        assert_eq!(contents(&session.transcript().await), vec![ABBY_OPENING_LINE]);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_send_delay_holds_messages_and_the_turn() {
        let mut value = reply(&["...", "fine."], false);
        value["howLongToWaitToSendMessages"] = json!(3_000);
        let (engine, _rx) = canned(vec![Ok(value)]);
        let session = engine.start("Abby").unwrap();

        let outcome = session.submit_user_message("hello").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Scheduled { deliver_in_ms: 3_000 });
        assert_eq!(
            session.submit_user_message("hello??").await,
            Err(ChatError::RequestInFlight)
        );

        tokio::time::sleep(Duration::from_millis(3_001)).await;
        let snapshot = session.snapshot().await;
        assert!(!snapshot.awaiting_reply);
        assert_eq!(
            contents(&snapshot.transcript),
            vec![ABBY_OPENING_LINE, "hello", "...", "fine."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn requested_delays_are_clamped() {
        let mut value = with_follow_up(reply(&["Hm."], false), 600_000, 0, "Hello?");
        value["howLongToWaitToSendMessages"] = json!(900_000);
        let policy = EnginePolicy {
            max_delay: Duration::from_secs(2),
            ..EnginePolicy::default()
        };
        let (engine, _rx) = engine_with(Arc::new(CannedReasoner::new(vec![Ok(value)])), policy);
        let session = engine.start("Abby").unwrap();

        let outcome = session.submit_user_message("hello").await.unwrap();
        assert_eq!(outcome, TurnOutcome::Scheduled { deliver_in_ms: 2_000 });

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        let transcript = session.transcript().await;
        assert_eq!(transcript.last().unwrap().content, "Hello?");
    }

    #[tokio::test]
    async fn reactions_attach_to_the_first_queued_message() {
        let mut value = reply(&["First.", "Second."], false);
        value["messageReactions"] = json!({ "2": "dislike", "99": "love", "abc": "laugh" });
        let (engine, _rx) = canned(vec![Ok(value)]);
        let session = engine.start("Abby").unwrap();
        session.submit_user_message("hello").await.unwrap();

        let transcript = session.transcript().await;
        let first = &transcript[2];
        assert_eq!(first.reactions.len(), 1);
        assert_eq!(reaction_for(first, 2), Some(Reaction::Dislike));
        assert!(transcript[3].reactions.is_empty());
    }

    #[tokio::test]
    async fn state_carries_into_the_next_request() {
        let (engine, _rx) = canned(vec![
            Ok(reply(&["One."], false)),
            Ok(reply(&["Two."], false)),
        ]);
        let session = engine.start("Abby").unwrap();
        session.submit_user_message("a message").await.unwrap();
        session.submit_user_message("another one").await.unwrap();

        let ids: Vec<u64> = session.transcript().await.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(session.snapshot().await.internal_state, "Abby is fuming.");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_ignores_late_replies() {
        let reasoner = CannedReasoner::new(vec![Ok(reply(&["Hello?"], false))])
            .slow(Duration::from_secs(1));
        let (engine, _rx) = engine_with(Arc::new(reasoner), EnginePolicy::default());
        let session = engine.start("Abby").unwrap();

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.submit_user_message("hey").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.close().await;

        assert_eq!(pending.await.unwrap(), Ok(TurnOutcome::Superseded));
        assert_eq!(
            contents(&session.transcript().await),
            vec![ABBY_OPENING_LINE, "hey"]
        );
    }

    #[tokio::test]
    async fn scripted_abby_breaks_up_on_please() {
        let (engine, _rx) = engine_with(
            Arc::new(ScriptedReasoner::default()),
            EnginePolicy::default(),
        );
        let session = engine.start("Abby").unwrap();

        session.submit_user_message("please don't go").await.unwrap();
        let snapshot = session.snapshot().await;
        assert!(snapshot.ended);
        let characters: Vec<&Message> = snapshot
            .transcript
            .iter()
            .skip(2)
            .filter(|m| m.is_from_character())
            .collect();
        assert_eq!(characters.len(), 2);
        assert_eq!(
            characters[1].content,
            "U just proved everything I thought. Bye forever."
        );
        assert_eq!(reaction_for(characters[0], 2), Some(Reaction::Laugh));
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_abby_escalates_then_gives_up_on_silence() {
        let (engine, _rx) = engine_with(
            Arc::new(ScriptedReasoner::default()),
            EnginePolicy::default(),
        );
        let session = engine.start("Abby").unwrap();

        session
            .submit_user_message("I think we should talk about this calmly")
            .await
            .unwrap();
        let snapshot = session.snapshot().await;
        assert!(!snapshot.ended);
        assert_eq!(snapshot.transcript.len(), 4);

        tokio::time::sleep(Duration::from_millis(10_001)).await;
        let snapshot = session.snapshot().await;
        assert_eq!(
            snapshot.transcript.last().unwrap().content,
            "Wow. Silence. I guess that says it all. Bye."
        );
        assert!(snapshot.ended);
    }
}
