// Character replies from an OpenAI-compatible chat endpoint (Ollama, LM Studio, vLLM, OpenAI, etc.)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ReasoningCollaborator, ReasoningRequest, UnparsableReply};
use crate::character::CharacterProfile;
use crate::config::ChatConfig;
use crate::session::message::Sender;

pub struct LlmReasoner {
    client: Client,
    api_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl LlmReasoner {
    pub fn new(
        api_url: String,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build LLM HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            model,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            temperature: 0.8,
            max_tokens: 1024,
        })
    }

    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        let mut reasoner = Self::new(
            config.llm_api_url.clone(),
            config.llm_model.clone(),
            config.llm_api_key.clone(),
            config.request_timeout(),
        )?;
        reasoner.temperature = config.llm_temperature;
        reasoner.max_tokens = config.llm_max_tokens;
        Ok(reasoner)
    }

    async fn call_llm(&self, system_prompt: &str, user_message: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.api_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_message.to_string(),
                },
            ],
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
        };

        let mut req_builder = self.client.post(&url).json(&request);

        if let Some(key) = &self.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = req_builder
            .send()
            .await
            .context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .context("Empty LLM response")
    }
}

#[async_trait]
impl ReasoningCollaborator for LlmReasoner {
    fn name(&self) -> &str {
        &self.model
    }

    async fn respond(&self, request: &ReasoningRequest) -> Result<Value> {
        let system_prompt = build_system_prompt(&request.profile, &request.internal_state);
        let user_message = build_turn_prompt(request);

        let raw = self.call_llm(&system_prompt, &user_message).await?;
        tracing::debug!("LLM reply for {}: {}", request.profile.id, raw);

        parse_reply(&raw)
    }
}

/// Turn the model's raw text into the JSON value the engine validates. Any
/// failure here is the model breaking the response format, so it surfaces as
/// [`UnparsableReply`] rather than a transport error.
pub fn parse_reply(raw: &str) -> Result<Value> {
    let json = extract_json(raw).map_err(|e| UnparsableReply(format!("{:#}", e)))?;
    let value = serde_json::from_str(&json).map_err(|e| UnparsableReply(e.to_string()))?;
    Ok(value)
}

/// Character sheet, current disposition and output contract.
pub fn build_system_prompt(profile: &CharacterProfile, internal_state: &str) -> String {
    let mut prompt = format!(
        "You are {} in a text-message conversation with the user. Stay in character at all times.\n\n",
        profile.id
    );

    prompt.push_str("## Bio\n\n");
    for section in &profile.bio {
        prompt.push_str(&format!("### {}\n", section.title));
        for point in &section.points {
            prompt.push_str(&format!("- {}\n", point));
        }
        prompt.push('\n');
    }

    if !internal_state.trim().is_empty() {
        prompt.push_str("## Your current internal state\n\n");
        prompt.push_str(internal_state.trim());
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Response format\n\n");
    prompt.push_str(
        "Respond with ONLY a JSON object (no prose, no markdown) containing every one of these fields:\n\n",
    );
    for field in &profile.response_contract {
        prompt.push_str(&format!(
            "- \"{}\" ({})\n",
            field.field_name,
            field.value_type.prompt_hint()
        ));
        for line in &field.instructions {
            prompt.push_str(&format!("    - {}\n", line));
        }
    }

    if !profile.example.trim().is_empty() {
        prompt.push_str("\n## Example response\n\n");
        prompt.push_str(profile.example.trim());
        prompt.push('\n');
    }

    prompt
}

/// The transcript with message ids, which reaction keys refer to.
pub fn build_turn_prompt(request: &ReasoningRequest) -> String {
    let name = &request.profile.id;
    let mut prompt = String::from("## Conversation so far\n\n");
    for message in &request.transcript {
        let speaker = match message.sender {
            Sender::User => "User",
            Sender::Character => name.as_str(),
        };
        prompt.push_str(&format!("[{}] {}: {}\n", message.id, speaker, message.content));
    }

    prompt.push_str(&format!(
        "\nWrite {}'s next move as the JSON object described above. \
         Keys in \"messageReactions\" must be ids shown in brackets.",
        name
    ));
    prompt
}

/// Pull the reply object out of whatever the model wrapped it in.
///
/// Local models rarely return the bare object the contract asks for. In
/// practice we see, in rough order of frequency: a ```json fence, a sentence
/// of in-character chatter before the object, `<think>` blocks from
/// reasoning models, and hand-written JSON with trailing commas or `//`
/// notes next to delay fields. Strategies are tried from the most to the
/// least specific.
fn extract_json(response: &str) -> Result<String> {
    let trimmed = response.trim();

    let without_thinking = strip_thinking_tags(trimmed);
    let text = if without_thinking != trimmed {
        tracing::debug!("Stripped thinking tags from reply");
        &without_thinking
    } else {
        trimmed
    };

    if let Some(json) = extract_from_markdown_code_block(text) {
        tracing::debug!("Extracted JSON from markdown code block");
        return Ok(json);
    }

    if let Some(json) = extract_by_delimiters(text) {
        tracing::debug!("Extracted JSON using delimiter matching");
        return Ok(json);
    }

    if serde_json::from_str::<Value>(text).is_ok() {
        return Ok(text.to_string());
    }

    let cleaned = clean_json_string(text);
    if serde_json::from_str::<Value>(&cleaned).is_ok() {
        tracing::debug!("Extracted JSON after cleaning (trailing commas, comments, quotes)");
        return Ok(cleaned);
    }

    // No object at all usually means the model answered in character
    // instead of filling in the contract, or ran out of tokens.
    if !text.contains('{') {
        tracing::warn!("Reply contains no JSON object; the model may have answered in prose or been cut off (llm_max_tokens)");
        anyhow::bail!("no JSON object in reply");
    }
    tracing::warn!("Reply has braces but none of the extraction strategies produced valid JSON");
    anyhow::bail!("could not extract a JSON object from reply")
}

/// Strip <think>...</think> and <thinking>...</thinking> blocks. Reasoning
/// models sometimes emit braces in there, which would fool the delimiter
/// search. An unclosed opening tag is dropped on its own.
fn strip_thinking_tags(text: &str) -> String {
    let mut result = text.to_string();

    for (open_tag, close_tag) in [("<thinking>", "</thinking>"), ("<think>", "</think>")] {
        while let Some(start) = result.find(open_tag) {
            if let Some(end) = result[start..].find(close_tag) {
                let end_pos = start + end + close_tag.len();
                result.replace_range(start..end_pos, "");
            } else {
                result.replace_range(start..start + open_tag.len(), "");
            }
        }
    }

    result.trim().to_string()
}

/// Content of the first ```json fence, or of the first bare fence when it
/// holds an object.
fn extract_from_markdown_code_block(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        if let Some(end) = text[start + 7..].find("```") {
            let json = text[start + 7..start + 7 + end].trim();
            return Some(json.to_string());
        }
    }

    if let Some(start) = text.find("```") {
        if let Some(end) = text[start + 3..].find("```") {
            let json = text[start + 3..start + 3 + end].trim();
            if json.starts_with('{') {
                return Some(json.to_string());
            }
        }
    }

    None
}

// Handles "ugh fine. {...} hope that works" style replies.
fn extract_by_delimiters(text: &str) -> Option<String> {
    let start = text.find('{')?;
    extract_balanced_braces(&text[start..], '{', '}')
}

/// First balanced `open`..`close` span, kept only if it parses. Braces
/// inside string values are counted too, which is fine for contract
/// replies since queued messages rarely contain them.
fn extract_balanced_braces(text: &str, open: char, close: char) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut depth = 0;
    let mut start = None;
    let mut end = None;

    for (i, &ch) in chars.iter().enumerate() {
        if ch == open {
            if depth == 0 {
                start = Some(i);
            }
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 && start.is_some() {
                end = Some(i);
                break;
            }
        }
    }

    if let (Some(s), Some(e)) = (start, end) {
        let result: String = chars[s..=e].iter().collect();
        if serde_json::from_str::<Value>(&result).is_ok() {
            return Some(result);
        }
    }

    None
}

/// Last resort for hand-written JSON: a stray `json` label, trailing commas,
/// comments and curly quotes.
fn clean_json_string(text: &str) -> String {
    let mut cleaned = text
        .trim_start_matches("json")
        .trim_start_matches("JSON")
        .trim()
        .to_string();

    cleaned = cleaned.replace(",}", "}");
    cleaned = cleaned.replace(",]", "]");

    cleaned = remove_comments(&cleaned);

    // Curly quotes as delimiters; apostrophes inside messages stay valid.
    cleaned = cleaned.replace('\u{201C}', "\"").replace('\u{201D}', "\"");
    cleaned = cleaned.replace('\u{2018}', "'").replace('\u{2019}', "'");

    cleaned
}

/// Remove `//` and `/* */` comments outside string literals, so a message
/// like "see u at 9//10" survives.
fn remove_comments(text: &str) -> String {
    let mut result = String::new();
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(ch) = chars.next() {
        if escape_next {
            result.push(ch);
            escape_next = false;
            continue;
        }

        if ch == '\\' && in_string {
            result.push(ch);
            escape_next = true;
            continue;
        }

        if ch == '"' {
            in_string = !in_string;
            result.push(ch);
            continue;
        }

        if !in_string && ch == '/' {
            match chars.peek() {
                Some('/') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if c == '\n' {
                            result.push(c);
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = ' ';
                    for c in chars.by_ref() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                    continue;
                }
                _ => {}
            }
        }

        result.push(ch);
    }

    result
}

// OpenAI-compatible API structures
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}
