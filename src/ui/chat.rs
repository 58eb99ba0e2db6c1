use std::collections::BTreeMap;

use pronto_backend::character::Reaction;
use pronto_backend::session::message::Message;
use pronto_backend::session::{EndReason, SessionSnapshot, TurnOutcome};

use crate::api::FrontendEvent;

pub fn reaction_glyph(reaction: Reaction) -> &'static str {
    match reaction {
        Reaction::Love => "❤️",
        Reaction::Like => "👍",
        Reaction::Dislike => "👎",
        Reaction::Laugh => "😂",
        Reaction::Question => "❓",
    }
}

/// What the user typed, once the leading slash commands are recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Reset,
    Characters,
    Help,
    Quit,
    Nothing,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Command::Nothing;
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "/quit" | "/exit" | "/q" => Command::Quit,
            "/reset" | "/restart" => Command::Reset,
            "/characters" | "/who" => Command::Characters,
            "/help" | "/?" => Command::Help,
            _ => Command::Say(trimmed.to_string()),
        }
    }
}

pub const HELP_TEXT: &str = "Commands: /reset starts over, /characters lists who you can text, /quit leaves.";

/// Local mirror of one session's transcript, fed by HTTP replies and pushed
/// events. Every method returns the lines that should be printed.
pub struct ChatView {
    character: String,
    typing_label: String,
    messages: BTreeMap<u64, Message>,
    ended: bool,
    /// Set after a local reset until the server's reset event arrives, so
    /// messages from before the reset are not replayed.
    awaiting_reset_event: bool,
}

impl ChatView {
    pub fn new(snapshot: &SessionSnapshot) -> Self {
        let mut view = Self {
            character: snapshot.character_id.clone(),
            typing_label: snapshot.typing_label.clone(),
            messages: BTreeMap::new(),
            ended: snapshot.ended,
            awaiting_reset_event: false,
        };
        for message in &snapshot.transcript {
            view.messages.insert(message.id, message.clone());
        }
        view
    }

    pub fn character(&self) -> &str {
        &self.character
    }

    pub fn typing_label(&self) -> &str {
        &self.typing_label
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn header(&self) -> Vec<String> {
        let mut lines = vec![format!("── Texting {} ──", self.character)];
        lines.extend(self.messages.values().map(|m| self.render_message(m)));
        if self.ended {
            lines.push(self.ended_notice(None));
        }
        lines
    }

    /// Start over from a fresh server snapshot.
    pub fn reset(&mut self, snapshot: &SessionSnapshot) -> Vec<String> {
        *self = Self::new(snapshot);
        self.awaiting_reset_event = true;
        let mut lines = vec!["── Conversation reset ──".to_string()];
        lines.extend(self.messages.values().map(|m| self.render_message(m)));
        lines
    }

    pub fn absorb_outcome(&mut self, outcome: TurnOutcome) -> Vec<String> {
        match outcome {
            TurnOutcome::Delivered {
                messages, ended, ..
            } => {
                let mut lines: Vec<String> = messages
                    .into_iter()
                    .filter_map(|m| self.absorb_message(m))
                    .collect();
                if ended && !self.ended {
                    self.ended = true;
                    lines.push(self.ended_notice(Some(EndReason::BrokeUp)));
                }
                lines
            }
            TurnOutcome::Scheduled { .. } => vec![self.typing_label.clone()],
            TurnOutcome::Superseded => Vec::new(),
        }
    }

    pub fn apply_event(&mut self, event: FrontendEvent) -> Vec<String> {
        match event {
            FrontendEvent::Reset => {
                self.awaiting_reset_event = false;
                Vec::new()
            }
            _ if self.awaiting_reset_event => Vec::new(),
            FrontendEvent::MessageAppended(message) => {
                self.absorb_message(message).into_iter().collect()
            }
            FrontendEvent::Ended(reason) => {
                if self.ended {
                    return Vec::new();
                }
                self.ended = true;
                vec![self.ended_notice(Some(reason))]
            }
            FrontendEvent::FollowUpArmed { fires_in_ms } => {
                tracing::debug!("{} will follow up in {} ms", self.character, fires_in_ms);
                Vec::new()
            }
            FrontendEvent::TurnFailed { error } => {
                tracing::debug!("Turn failed (already reported): {}", error);
                Vec::new()
            }
        }
    }

    /// Record a message; returns its rendering unless it was already known or
    /// is the user's own line.
    fn absorb_message(&mut self, message: Message) -> Option<String> {
        if self.messages.contains_key(&message.id) {
            return None;
        }
        let line = message
            .is_from_character()
            .then(|| self.render_message(&message));
        self.messages.insert(message.id, message);
        line
    }

    pub fn render_message(&self, message: &Message) -> String {
        let speaker = if message.is_from_character() {
            self.character.as_str()
        } else {
            "You"
        };
        let mut line = format!(
            "[{}] {}: {}",
            message.created_at.format("%H:%M"),
            speaker,
            message.content
        );
        for (target, reaction) in &message.reactions {
            let quoted = target
                .parse::<u64>()
                .ok()
                .and_then(|id| self.messages.get(&id))
                .map(|m| preview(&m.content))
                .unwrap_or_else(|| format!("#{}", target));
            line.push_str(&format!("  ({} {})", reaction_glyph(*reaction), quoted));
        }
        line
    }

    fn ended_notice(&self, reason: Option<EndReason>) -> String {
        let what = match reason {
            Some(EndReason::Silence) => format!("{} stopped replying", self.character),
            _ => format!("{} has ended the conversation", self.character),
        };
        format!("── {}. Type /reset to start over or /quit to leave. ──", what)
    }
}

fn preview(content: &str) -> String {
    const MAX_CHARS: usize = 24;
    if content.chars().count() <= MAX_CHARS {
        format!("\"{}\"", content)
    } else {
        let head: String = content.chars().take(MAX_CHARS).collect();
        format!("\"{}…\"", head)
    }
}
