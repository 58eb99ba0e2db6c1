use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::character::contract::{
    ContractField, FieldType, FIELD_BREAK_UP, FIELD_DEADLINE, FIELD_FOLLOW_UP_DELAY,
    FIELD_FOLLOW_UP_MESSAGE, FIELD_MESSAGE_REACTIONS, FIELD_NEW_INTERNAL_STATE,
    FIELD_QUEUED_MESSAGES, FIELD_SEND_DELAY, FIELD_STATE_PROGRESSION,
};
use crate::character::profile::{BioSection, CharacterProfile, InternalState};

/// TavernAI Character Card V2 format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TavernAICardV2 {
    pub spec: String,
    pub spec_version: String,
    pub data: TavernAIData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TavernAIData {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub first_mes: String,
    #[serde(default)]
    pub mes_example: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub post_history_instructions: String,
}

/// Parse a character card file, returning the profile and the detected format.
///
/// Supported: native profile cards as JSON or TOML, and TavernAI V2 JSON cards
/// (which get the generic response contract).
pub fn parse_character_card<P: AsRef<Path>>(path: P) -> Result<(CharacterProfile, String)> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref)
        .with_context(|| format!("Failed to read character card from {:?}", path_ref))?;

    let is_toml = path_ref
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    if is_toml {
        let profile = parse_profile_toml(&content)
            .with_context(|| format!("Failed to parse TOML card {:?}", path_ref))?;
        return Ok((profile, "pronto_toml".to_string()));
    }

    let native_error = match parse_profile_json(&content) {
        Ok(profile) => return Ok((profile, "pronto_json".to_string())),
        Err(e) => e,
    };

    match parse_tavernai_v2(&content) {
        Ok(profile) => Ok((profile, "tavernai_v2".to_string())),
        Err(tavern_error) => {
            tracing::debug!("{:?} is not a TavernAI V2 card: {:#}", path_ref, tavern_error);
            // The native error names the offending field.
            Err(native_error).with_context(|| {
                format!(
                    "Unable to parse character card {:?} - unknown or unsupported format",
                    path_ref
                )
            })
        }
    }
}

/// Load every `*.json` / `*.toml` card in a directory, in file-name order.
pub fn load_card_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<CharacterProfile>> {
    let dir = dir.as_ref();
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read profile directory {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut profiles = Vec::with_capacity(paths.len());
    for path in paths {
        let (profile, format) = parse_character_card(&path)?;
        tracing::info!(
            "Loaded character card '{}' from {:?} ({})",
            profile.id,
            path,
            format
        );
        profiles.push(profile);
    }
    Ok(profiles)
}

fn parse_profile_json(content: &str) -> Result<CharacterProfile> {
    serde_json::from_str(content).context("Failed to parse as profile JSON")
}

fn parse_profile_toml(content: &str) -> Result<CharacterProfile> {
    toml::from_str(content).context("Failed to parse as profile TOML")
}

/// Parse TavernAI V2 format
fn parse_tavernai_v2(content: &str) -> Result<CharacterProfile> {
    let card: TavernAICardV2 =
        serde_json::from_str(content).context("Failed to parse as TavernAI V2 JSON")?;
    let data = card.data;

    let mut bio = Vec::new();
    for (title, text) in [
        ("Description", &data.description),
        ("Personality", &data.personality),
        ("Scenario", &data.scenario),
        ("Instructions", &data.system_prompt),
        ("Example dialogue", &data.mes_example),
    ] {
        let points: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        if !points.is_empty() {
            bio.push(BioSection {
                title: title.to_string(),
                points,
            });
        }
    }

    let mut status = Vec::new();
    if !data.post_history_instructions.trim().is_empty() {
        status.push(data.post_history_instructions.trim().to_string());
    }

    Ok(CharacterProfile {
        id: data.name.clone(),
        bio,
        internal_state: InternalState {
            status,
            objectives: vec![format!("Stay in character as {}.", data.name)],
            feeling: String::new(),
        },
        response_contract: default_contract(),
        opening_line: data.first_mes,
        example: String::new(),
        ends_on_silence: false,
        typing_label: None,
    })
}

/// Generic contract used for cards that do not carry their own.
pub fn default_contract() -> Vec<ContractField> {
    vec![
        ContractField::new(
            FIELD_NEW_INTERNAL_STATE,
            FieldType::String,
            &["Describe how the character feels after the user's latest message."],
        ),
        ContractField::new(
            FIELD_QUEUED_MESSAGES,
            FieldType::StringList,
            &[
                "One to three short chat messages, in order.",
                "Never repeat a message that is already in the conversation history.",
            ],
        ),
        ContractField::new(
            FIELD_BREAK_UP,
            FieldType::Boolean,
            &["Set to true only when the character ends the conversation for good."],
        ),
        ContractField::new(
            FIELD_STATE_PROGRESSION,
            FieldType::Boolean,
            &["True when this turn meaningfully changes the character's disposition."],
        ),
        ContractField::new(
            FIELD_MESSAGE_REACTIONS,
            FieldType::ReactionMap,
            &["Map a message id from the history to a reaction, or leave empty."],
        ),
        ContractField::new(
            FIELD_SEND_DELAY,
            FieldType::Number,
            &["Milliseconds to wait before sending the queued messages."],
        ),
        ContractField::new(
            FIELD_FOLLOW_UP_DELAY,
            FieldType::Number,
            &["Milliseconds to wait after sending before following up."],
        ),
        ContractField::new(
            FIELD_FOLLOW_UP_MESSAGE,
            FieldType::String,
            &["Message to send if the user stays silent; empty for none."],
        ),
        ContractField::new(
            FIELD_DEADLINE,
            FieldType::Number,
            &["Longest silence in milliseconds the character tolerates."],
        ),
    ]
}
