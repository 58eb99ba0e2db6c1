//! Boundary validation of reasoning-engine output against a response contract.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::character::contract::{
    expected_engine_type, FIELD_BREAK_UP, FIELD_DEADLINE, FIELD_FOLLOW_UP_DELAY,
    FIELD_FOLLOW_UP_MESSAGE, FIELD_MESSAGE_REACTIONS, FIELD_NEW_INTERNAL_STATE,
    FIELD_QUEUED_MESSAGES, FIELD_SEND_DELAY, FIELD_STATE_PROGRESSION,
};
use crate::character::{ContractField, FieldType, Reaction};
use crate::error::ChatError;

/// A validated engine response. Fields the contract does not declare take
/// their neutral value (no delay, no follow-up, no reactions).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineResponse {
    pub new_internal_state: Option<String>,
    pub queued_messages: Vec<String>,
    pub break_up_with_user: bool,
    pub is_state_progression: bool,
    pub message_reactions: BTreeMap<String, Reaction>,
    pub send_delay: Duration,
    pub follow_up_delay: Duration,
    pub follow_up_message: Option<String>,
    pub deadline: Duration,
    /// Values of contract fields the engine does not interpret.
    pub extra: BTreeMap<String, Value>,
}

impl EngineResponse {
    /// Validate `value` against every field of `contract`; all violations are
    /// reported together.
    pub fn from_contract(contract: &[ContractField], value: &Value) -> Result<Self, ChatError> {
        let Some(object) = value.as_object() else {
            return Err(ChatError::MalformedResponse(vec![format!(
                "expected a JSON object, found {}",
                json_kind(value)
            )]));
        };

        let mut violations = Vec::new();
        for field in contract {
            match object.get(&field.field_name) {
                None | Some(Value::Null) => {
                    violations.push(format!("missing field '{}'", field.field_name));
                }
                Some(raw) => {
                    if let Err(reason) = check_type(field.value_type, raw) {
                        violations.push(format!("field '{}' {}", field.field_name, reason));
                    }
                }
            }
        }
        if !violations.is_empty() {
            return Err(ChatError::MalformedResponse(violations));
        }

        let declared = |name: &str| contract.iter().any(|f| f.field_name == name);
        let mut response = EngineResponse::default();

        if declared(FIELD_NEW_INTERNAL_STATE) {
            response.new_internal_state = str_field(object, FIELD_NEW_INTERNAL_STATE)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from);
        }
        if declared(FIELD_QUEUED_MESSAGES) {
            response.queued_messages = object[FIELD_QUEUED_MESSAGES]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|s| s.trim().to_string())
                        .collect()
                })
                .unwrap_or_default();
        }
        if declared(FIELD_BREAK_UP) {
            response.break_up_with_user = object[FIELD_BREAK_UP].as_bool().unwrap_or(false);
        }
        if declared(FIELD_STATE_PROGRESSION) {
            response.is_state_progression =
                object[FIELD_STATE_PROGRESSION].as_bool().unwrap_or(false);
        }
        if declared(FIELD_MESSAGE_REACTIONS) {
            if let Some(map) = object[FIELD_MESSAGE_REACTIONS].as_object() {
                for (key, tag) in map {
                    if let Some(reaction) = tag.as_str().and_then(Reaction::parse) {
                        response.message_reactions.insert(key.clone(), reaction);
                    }
                }
            }
        }
        if declared(FIELD_SEND_DELAY) {
            response.send_delay = millis_field(object, FIELD_SEND_DELAY);
        }
        if declared(FIELD_FOLLOW_UP_DELAY) {
            response.follow_up_delay = millis_field(object, FIELD_FOLLOW_UP_DELAY);
        }
        if declared(FIELD_FOLLOW_UP_MESSAGE) {
            response.follow_up_message = str_field(object, FIELD_FOLLOW_UP_MESSAGE)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from);
        }
        if declared(FIELD_DEADLINE) {
            response.deadline = millis_field(object, FIELD_DEADLINE);
        }

        for field in contract {
            if expected_engine_type(&field.field_name).is_none() {
                response
                    .extra
                    .insert(field.field_name.clone(), object[&field.field_name].clone());
            }
        }

        for (index, message) in response.queued_messages.iter().enumerate() {
            if message.is_empty() {
                violations.push(format!("field '{}'[{}] is blank", FIELD_QUEUED_MESSAGES, index));
            }
        }
        if response.break_up_with_user && response.queued_messages.is_empty() {
            violations.push(format!(
                "'{}' is set but '{}' is empty; a terminating turn needs a final message",
                FIELD_BREAK_UP, FIELD_QUEUED_MESSAGES
            ));
        }
        if !violations.is_empty() {
            return Err(ChatError::MalformedResponse(violations));
        }

        Ok(response)
    }

    /// When an unanswered follow-up fires, relative to delivery.
    pub fn follow_up_after(&self) -> Duration {
        self.follow_up_delay.max(self.deadline)
    }
}

fn check_type(expected: FieldType, value: &Value) -> Result<(), String> {
    match expected {
        FieldType::String => {
            if value.is_string() {
                Ok(())
            } else {
                Err(format!("must be a string, found {}", json_kind(value)))
            }
        }
        FieldType::StringList => {
            let Some(items) = value.as_array() else {
                return Err(format!("must be a list of strings, found {}", json_kind(value)));
            };
            match items.iter().position(|item| !item.is_string()) {
                Some(index) => Err(format!(
                    "must be a list of strings, item {} is {}",
                    index,
                    json_kind(&items[index])
                )),
                None => Ok(()),
            }
        }
        FieldType::Boolean => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err(format!("must be a boolean, found {}", json_kind(value)))
            }
        }
        FieldType::Number => match value.as_f64() {
            Some(n) if n.is_finite() && n >= 0.0 => Ok(()),
            Some(n) => Err(format!("must be a non-negative number, found {}", n)),
            None => Err(format!("must be a number, found {}", json_kind(value))),
        },
        FieldType::ReactionMap => {
            let Some(map) = value.as_object() else {
                return Err(format!("must be a reaction map, found {}", json_kind(value)));
            };
            for (key, tag) in map {
                if tag.as_str().and_then(Reaction::parse).is_none() {
                    return Err(format!(
                        "has unknown reaction {} for key '{}'",
                        tag, key
                    ));
                }
            }
            Ok(())
        }
    }
}

fn str_field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    object.get(name).and_then(Value::as_str)
}

fn millis_field(object: &Map<String, Value>, name: &str) -> Duration {
    let millis = object.get(name).and_then(Value::as_f64).unwrap_or(0.0);
    Duration::from_millis(millis.round() as u64)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::abby::abby;
    use serde_json::json;

    fn abby_contract() -> Vec<ContractField> {
        abby().response_contract
    }

    fn escalating_reply() -> Value {
        json!({
            "newInternalState": "Abby is getting more frustrated.",
            "queuedMessages": ["OMG seriously? That's all u have to say? 😤", "I can't even with u rn."],
            "breakUpWithUser": false,
            "isStateProgression": false,
            "messageReactions": { "2": "dislike" },
            "howLongToWaitToSendMessages": 0,
            "howLongToWaitAfterSendingToFollowUp": 5000,
            "followUpMessage": "Wow. Silence. I guess that says it all. Bye.",
            "deadline": 10000
        })
    }

    fn violations(result: Result<EngineResponse, ChatError>) -> Vec<String> {
        match result {
            Err(ChatError::MalformedResponse(v)) => v,
            other => panic!("expected malformed response, got {:?}", other),
        }
    }

    #[test]
    fn valid_reply_is_parsed() {
        let response = EngineResponse::from_contract(&abby_contract(), &escalating_reply()).unwrap();
        assert_eq!(response.queued_messages.len(), 2);
        assert!(!response.break_up_with_user);
        assert_eq!(response.message_reactions.get("2"), Some(&Reaction::Dislike));
        assert_eq!(response.follow_up_delay, Duration::from_millis(5000));
        assert_eq!(response.deadline, Duration::from_millis(10000));
        assert_eq!(response.follow_up_after(), Duration::from_millis(10000));
        assert_eq!(
            response.follow_up_message.as_deref(),
            Some("Wow. Silence. I guess that says it all. Bye.")
        );
    }

    #[test]
    fn missing_and_mistyped_fields_are_all_reported() {
        let mut reply = escalating_reply();
        let object = reply.as_object_mut().unwrap();
        object.remove("deadline");
        object.insert("breakUpWithUser".to_string(), json!("nope"));
        object.insert("queuedMessages".to_string(), json!(["ok", 3]));

        let v = violations(EngineResponse::from_contract(&abby_contract(), &reply));
        assert_eq!(v.len(), 3);
        assert!(v.iter().any(|m| m == "missing field 'deadline'"));
        assert!(v.iter().any(|m| m.contains("'breakUpWithUser' must be a boolean")));
        assert!(v.iter().any(|m| m.contains("item 1 is a number")));
    }

    #[test]
    fn unknown_reaction_tag_is_rejected() {
        let mut reply = escalating_reply();
        reply["messageReactions"] = json!({ "2": "shrug" });
        let v = violations(EngineResponse::from_contract(&abby_contract(), &reply));
        assert!(v[0].contains("unknown reaction"));
    }

    #[test]
    fn negative_delay_is_rejected() {
        let mut reply = escalating_reply();
        reply["howLongToWaitToSendMessages"] = json!(-50);
        let v = violations(EngineResponse::from_contract(&abby_contract(), &reply));
        assert!(v[0].contains("non-negative"));
    }

    #[test]
    fn non_object_reply_is_rejected() {
        let v = violations(EngineResponse::from_contract(&abby_contract(), &json!(["hi"])));
        assert!(v[0].contains("a list"));
    }

    #[test]
    fn terminating_turn_without_messages_is_rejected() {
        let mut reply = escalating_reply();
        reply["breakUpWithUser"] = json!(true);
        reply["queuedMessages"] = json!([]);
        let v = violations(EngineResponse::from_contract(&abby_contract(), &reply));
        assert!(v[0].contains("terminating turn needs a final message"));
    }

    #[test]
    fn blank_queued_message_is_rejected() {
        let mut reply = escalating_reply();
        reply["queuedMessages"] = json!(["fine.", "   "]);
        let v = violations(EngineResponse::from_contract(&abby_contract(), &reply));
        assert!(v[0].contains("[1] is blank"));
    }

    #[test]
    fn undeclared_engine_fields_are_ignored_and_custom_fields_kept() {
        let contract = vec![
            ContractField::new(FIELD_QUEUED_MESSAGES, FieldType::StringList, &[]),
            ContractField::new(FIELD_BREAK_UP, FieldType::Boolean, &[]),
            ContractField::new("mood", FieldType::String, &[]),
        ];
        let reply = json!({
            "queuedMessages": ["hm."],
            "breakUpWithUser": false,
            "deadline": 9000,
            "mood": "sulky"
        });
        let response = EngineResponse::from_contract(&contract, &reply).unwrap();
        assert_eq!(response.deadline, Duration::ZERO);
        assert_eq!(response.extra.get("mood"), Some(&json!("sulky")));
        assert!(response.follow_up_message.is_none());
    }
}
