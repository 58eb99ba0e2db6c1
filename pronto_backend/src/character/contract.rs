//! Response contract schema: the fields a reasoning engine must return for a
//! character's turn, with their value types and behavioral instructions.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const FIELD_NEW_INTERNAL_STATE: &str = "newInternalState";
pub const FIELD_QUEUED_MESSAGES: &str = "queuedMessages";
pub const FIELD_BREAK_UP: &str = "breakUpWithUser";
pub const FIELD_STATE_PROGRESSION: &str = "isStateProgression";
pub const FIELD_MESSAGE_REACTIONS: &str = "messageReactions";
pub const FIELD_SEND_DELAY: &str = "howLongToWaitToSendMessages";
pub const FIELD_FOLLOW_UP_DELAY: &str = "howLongToWaitAfterSendingToFollowUp";
pub const FIELD_FOLLOW_UP_MESSAGE: &str = "followUpMessage";
pub const FIELD_DEADLINE: &str = "deadline";

/// Fields the conversation engine itself interprets, with the type each must
/// be declared as when a contract includes it.
pub const ENGINE_FIELDS: &[(&str, FieldType)] = &[
    (FIELD_NEW_INTERNAL_STATE, FieldType::String),
    (FIELD_QUEUED_MESSAGES, FieldType::StringList),
    (FIELD_BREAK_UP, FieldType::Boolean),
    (FIELD_STATE_PROGRESSION, FieldType::Boolean),
    (FIELD_MESSAGE_REACTIONS, FieldType::ReactionMap),
    (FIELD_SEND_DELAY, FieldType::Number),
    (FIELD_FOLLOW_UP_DELAY, FieldType::Number),
    (FIELD_FOLLOW_UP_MESSAGE, FieldType::String),
    (FIELD_DEADLINE, FieldType::Number),
];

/// Fields every contract must declare for the state machine to make progress.
pub const REQUIRED_ENGINE_FIELDS: &[&str] = &[FIELD_QUEUED_MESSAGES, FIELD_BREAK_UP];

pub fn expected_engine_type(field_name: &str) -> Option<FieldType> {
    ENGINE_FIELDS
        .iter()
        .find(|(name, _)| *name == field_name)
        .map(|(_, ty)| *ty)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Love,
    Like,
    Dislike,
    Laugh,
    Question,
}

impl Reaction {
    pub const ALL: [Reaction; 5] = [
        Reaction::Love,
        Reaction::Like,
        Reaction::Dislike,
        Reaction::Laugh,
        Reaction::Question,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Reaction::Love => "love",
            Reaction::Like => "like",
            Reaction::Dislike => "dislike",
            Reaction::Laugh => "laugh",
            Reaction::Question => "question",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "love" => Some(Reaction::Love),
            "like" => Some(Reaction::Like),
            "dislike" => Some(Reaction::Dislike),
            "laugh" => Some(Reaction::Laugh),
            "question" => Some(Reaction::Question),
            _ => None,
        }
    }
}

impl fmt::Display for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value type tag of a contract field.
///
/// Cards may use TypeScript spellings (`string[]`,
/// `Record<string, 'love' | ...>`) or the canonical names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    String,
    StringList,
    Boolean,
    Number,
    ReactionMap,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::StringList => "string[]",
            FieldType::Boolean => "boolean",
            FieldType::Number => "number",
            FieldType::ReactionMap => "reaction_map",
        }
    }

    /// Human-readable type used when describing the contract to a model.
    pub fn prompt_hint(self) -> String {
        match self {
            FieldType::ReactionMap => {
                let tags: Vec<String> = Reaction::ALL
                    .iter()
                    .map(|r| format!("'{}'", r.as_str()))
                    .collect();
                format!("Record<string, {}>", tags.join(" | "))
            }
            other => other.as_str().to_string(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "string" | "str" => Some(FieldType::String),
            "string[]" | "string_list" | "list<string>" | "vec<string>" => {
                Some(FieldType::StringList)
            }
            "boolean" | "bool" => Some(FieldType::Boolean),
            "number" | "integer" | "float" => Some(FieldType::Number),
            "reaction_map" | "reactions" => Some(FieldType::ReactionMap),
            other if other.starts_with("record<string,") => Some(FieldType::ReactionMap),
            _ => None,
        }
    }
}

impl TryFrom<String> for FieldType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldType::parse(&value).ok_or_else(|| format!("unknown contract field type '{}'", value))
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a character's response contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractField {
    #[serde(alias = "field_name")]
    pub field_name: String,
    #[serde(rename = "type", alias = "value_type")]
    pub value_type: FieldType,
    #[serde(default)]
    pub instructions: Vec<String>,
}

impl ContractField {
    pub fn new(field_name: &str, value_type: FieldType, instructions: &[&str]) -> Self {
        Self {
            field_name: field_name.to_string(),
            value_type,
            instructions: instructions.iter().map(|s| s.to_string()).collect(),
        }
    }
}
