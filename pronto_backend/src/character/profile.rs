use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::contract::{expected_engine_type, ContractField, REQUIRED_ENGINE_FIELDS};
use crate::error::ProfileError;

/// A titled block of lore fed to the reasoning engine as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BioSection {
    pub title: String,
    #[serde(default)]
    pub points: Vec<String>,
}

/// Seed disposition of a character before the first user turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalState {
    #[serde(default)]
    pub status: Vec<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub feeling: String,
}

impl InternalState {
    /// Flatten into the free-text description carried by a session.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.status.is_empty() {
            parts.push(format!("Status:\n- {}", self.status.join("\n- ")));
        }
        if !self.objectives.is_empty() {
            parts.push(format!("Objectives:\n- {}", self.objectives.join("\n- ")));
        }
        if !self.feeling.trim().is_empty() {
            parts.push(format!("Feeling: {}", self.feeling.trim()));
        }
        parts.join("\n\n")
    }
}

/// Immutable behavioral specification of a character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterProfile {
    #[serde(alias = "name")]
    pub id: String,
    pub bio: Vec<BioSection>,
    #[serde(default, alias = "internal_state")]
    pub internal_state: InternalState,
    #[serde(alias = "response", alias = "response_contract")]
    pub response_contract: Vec<ContractField>,
    #[serde(alias = "opening_line", alias = "first_message")]
    pub opening_line: String,
    #[serde(default)]
    pub example: String,
    /// Unanswered follow-ups end the conversation.
    #[serde(default, alias = "ends_on_silence")]
    pub ends_on_silence: bool,
    #[serde(default, alias = "typing_label")]
    pub typing_label: Option<String>,
}

/// What the UI needs to list a character.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: String,
    pub tagline: String,
    pub typing_label: String,
}

impl CharacterProfile {
    pub fn matches_id(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id.trim())
    }

    pub fn contract_field(&self, name: &str) -> Option<&ContractField> {
        self.response_contract.iter().find(|f| f.field_name == name)
    }

    pub fn typing_label(&self) -> String {
        self.typing_label
            .clone()
            .unwrap_or_else(|| format!("{} is typing...", self.id))
    }

    pub fn summary(&self) -> ProfileSummary {
        let tagline = self
            .bio
            .first()
            .and_then(|section| section.points.first())
            .cloned()
            .unwrap_or_default();
        ProfileSummary {
            id: self.id.clone(),
            tagline,
            typing_label: self.typing_label(),
        }
    }

    /// Structural checks run once at load; behavior lives in the instruction
    /// text and is not inspected.
    pub fn validate(&self) -> Result<(), ProfileError> {
        let mut problems = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("id is empty".to_string());
        }
        if self.opening_line.trim().is_empty() {
            problems.push("opening line is empty".to_string());
        }
        if self.bio.is_empty() {
            problems.push("bio has no sections".to_string());
        }
        if self.response_contract.is_empty() {
            problems.push("response contract has no fields".to_string());
        }

        let mut seen = HashSet::new();
        for field in &self.response_contract {
            if field.field_name.trim().is_empty() {
                problems.push("contract field with empty name".to_string());
                continue;
            }
            if !seen.insert(field.field_name.as_str()) {
                problems.push(format!(
                    "contract field '{}' declared more than once",
                    field.field_name
                ));
            }
            if let Some(expected) = expected_engine_type(&field.field_name) {
                if expected != field.value_type {
                    problems.push(format!(
                        "contract field '{}' must be declared as {}, found {}",
                        field.field_name, expected, field.value_type
                    ));
                }
            }
        }

        if !self.response_contract.is_empty() {
            for required in REQUIRED_ENGINE_FIELDS {
                if self.contract_field(required).is_none() {
                    problems.push(format!("contract is missing required field '{}'", required));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ProfileError::Invalid {
                id: self.id.clone(),
                problems,
            })
        }
    }
}
