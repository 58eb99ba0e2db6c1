//! Reasoning collaborators: whatever decides what the character says next.

pub mod reasoning;
pub mod response;
pub mod scripted;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::character::CharacterProfile;
use crate::session::message::Message;

pub use reasoning::LlmReasoner;
pub use response::EngineResponse;
pub use scripted::ScriptedReasoner;

/// One turn's worth of context handed to a collaborator.
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub transcript: Vec<Message>,
    pub profile: Arc<CharacterProfile>,
    pub internal_state: String,
}

impl ReasoningRequest {
    /// The newest user message, which is what the turn responds to.
    pub fn latest_user_message(&self) -> Option<&Message> {
        self.transcript.iter().rev().find(|m| !m.is_from_character())
    }
}

/// The collaborator answered, but what it said is not a JSON value. The
/// engine treats this as a malformed response rather than an outage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("reply is not valid JSON: {0}")]
pub struct UnparsableReply(pub String);

/// Produces a raw structured reply for a turn. The engine validates the
/// value against the profile's response contract, so implementations do not
/// need to.
#[async_trait]
pub trait ReasoningCollaborator: Send + Sync {
    fn name(&self) -> &str;

    /// Transport failures come back as plain errors; a reply that cannot be
    /// read as JSON should come back as [`UnparsableReply`].
    async fn respond(&self, request: &ReasoningRequest) -> Result<Value>;
}
