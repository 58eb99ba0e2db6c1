// Offline collaborator that plays Abby's two canned moves. Useful for demos
// and for running the server without an LLM endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use serde_json::{json, Value};

use super::{ReasoningCollaborator, ReasoningRequest};

const TRIGGER_PATTERN: &str = r"(?i)sorry|love|please";
const MIN_MESSAGE_CHARS: usize = 5;

pub struct ScriptedReasoner {
    latency: Duration,
    trigger: Option<Regex>,
}

impl Default for ScriptedReasoner {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl ScriptedReasoner {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            trigger: Regex::new(TRIGGER_PATTERN).ok(),
        }
    }

    /// Whether a user message provokes the breakup reply.
    pub fn is_breakup_trigger(&self, text: &str) -> bool {
        let has_trigger_word = self
            .trigger
            .as_ref()
            .map(|re| re.is_match(text))
            .unwrap_or(false);
        has_trigger_word || text.chars().count() < MIN_MESSAGE_CHARS
    }
}

fn breakup_reply(reply_to: &str) -> Value {
    json!({
        "newInternalState": "Abby is completely done and ready to break up.",
        "queuedMessages": [
            "LMAO U REALLY SAID THAT? I'm actually done.",
            "U just proved everything I thought. Bye forever."
        ],
        "breakUpWithUser": true,
        "isStateProgression": true,
        "messageReactions": { reply_to: "laugh" },
        "howLongToWaitToSendMessages": 0,
        "howLongToWaitAfterSendingToFollowUp": 0,
        "followUpMessage": "",
        "deadline": 0
    })
}

fn escalating_reply(reply_to: &str) -> Value {
    json!({
        "newInternalState": "Abby is getting more frustrated and looking for any excuse to end things.",
        "queuedMessages": [
            "OMG seriously? That's all u have to say? 😤",
            "I can't even with u rn."
        ],
        "breakUpWithUser": false,
        "isStateProgression": false,
        "messageReactions": { reply_to: "dislike" },
        "howLongToWaitToSendMessages": 0,
        "howLongToWaitAfterSendingToFollowUp": 5000,
        "followUpMessage": "Wow. Silence. I guess that says it all. Bye.",
        "deadline": 10000
    })
}

#[async_trait]
impl ReasoningCollaborator for ScriptedReasoner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn respond(&self, request: &ReasoningRequest) -> Result<Value> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let latest = request
            .latest_user_message()
            .context("Scripted reasoner needs a user message to reply to")?;
        let reply_to = latest.id.to_string();

        if self.is_breakup_trigger(&latest.content) {
            tracing::debug!("Scripted reply to message {}: breakup", reply_to);
            Ok(breakup_reply(&reply_to))
        } else {
            tracing::debug!("Scripted reply to message {}: escalate", reply_to);
            Ok(escalating_reply(&reply_to))
        }
    }
}
