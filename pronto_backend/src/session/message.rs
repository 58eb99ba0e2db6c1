use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::character::Reaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Character,
}

/// One transcript entry. Ids are per-session sequence numbers starting at 1,
/// which is what reaction keys refer to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub sender: Sender,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Reacted-to message id → reaction.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, Reaction>,
}

impl Message {
    pub fn new(id: u64, sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id,
            sender,
            content: content.into(),
            created_at: Utc::now(),
            reactions: BTreeMap::new(),
        }
    }

    pub fn is_from_character(&self) -> bool {
        self.sender == Sender::Character
    }
}
