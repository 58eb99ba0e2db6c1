use thiserror::Error;

/// Errors surfaced to callers of the conversation engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("no character profile registered for '{0}'")]
    ProfileNotFound(String),
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("message is empty")]
    EmptyInput,
    #[error("conversation has ended")]
    SessionEnded,
    #[error("a reply is still in flight for this session")]
    RequestInFlight,
    #[error("reasoning engine returned a malformed response: {}", .0.join("; "))]
    MalformedResponse(Vec<String>),
    #[error("reasoning engine unavailable: {0}")]
    ReasoningUnavailable(String),
}

impl ChatError {
    /// Stable snake_case identifier used in API payloads and events.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::ProfileNotFound(_) => "profile_not_found",
            ChatError::SessionNotFound(_) => "session_not_found",
            ChatError::EmptyInput => "empty_input",
            ChatError::SessionEnded => "session_ended",
            ChatError::RequestInFlight => "request_in_flight",
            ChatError::MalformedResponse(_) => "malformed_response",
            ChatError::ReasoningUnavailable(_) => "reasoning_unavailable",
        }
    }
}

/// Problems found while loading or validating character profiles.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile '{id}' is invalid: {}", .problems.join("; "))]
    Invalid { id: String, problems: Vec<String> },
    #[error("duplicate profile id '{0}'")]
    DuplicateId(String),
}
