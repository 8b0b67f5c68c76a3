use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{error::ServiceError, sampling::SamplingParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    DirectDecoder,
    CausalLm,
    Vision,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::DirectDecoder => "direct_decoder",
            BackendKind::CausalLm => "causal_lm",
            BackendKind::Vision => "vision",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Turns(Vec<ChatTurn>),
}

impl Prompt {
    pub fn char_len(&self) -> usize {
        match self {
            Prompt::Text(text) => text.chars().count(),
            Prompt::Turns(turns) => turns.iter().map(|t| t.content.chars().count()).sum(),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Prompt::Text(text) => text.trim().is_empty(),
            Prompt::Turns(turns) => turns.iter().all(|t| t.content.trim().is_empty()),
        }
    }

    /// Turn view of the prompt; bare text becomes a single user turn.
    pub fn into_turns(self) -> Vec<ChatTurn> {
        match self {
            Prompt::Text(text) => vec![ChatTurn::new(Role::User, text)],
            Prompt::Turns(turns) => turns,
        }
    }
}

/// A fully resolved generation request. Immutable once handed to a backend.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub backend_id: String,
    pub prompt: Prompt,
    pub max_tokens: usize,
    pub sampling: SamplingParams,
    pub image: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn new(backend_id: impl Into<String>, prompt: Prompt, max_tokens: usize) -> Self {
        Self {
            backend_id: backend_id.into(),
            prompt,
            max_tokens,
            sampling: SamplingParams::default(),
            image: None,
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Prepends earlier turns to the prompt, turning it into a transcript.
    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        if history.is_empty() {
            return self;
        }
        let mut turns = history;
        turns.extend(self.prompt.into_turns());
        self.prompt = Prompt::Turns(turns);
        self
    }

    pub fn validate(&self, max_prompt_chars: usize) -> Result<(), ServiceError> {
        if self.prompt.is_blank() {
            return Err(ServiceError::validation("prompt must not be empty"));
        }
        let len = self.prompt.char_len();
        if len > max_prompt_chars {
            return Err(ServiceError::validation(format!(
                "prompt too long: {len} characters (limit {max_prompt_chars})"
            )));
        }
        if self.max_tokens == 0 {
            return Err(ServiceError::validation("max_tokens must be greater than 0"));
        }
        self.sampling.validate()
    }
}

/// Static description of a backend, served by `GET /models`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub id: String,
    pub kind: BackendKind,
    pub model_path: String,
    pub loaded: bool,
    pub device: String,
    pub supports_vision: bool,
    pub context_window: usize,
    pub description: Option<String>,
}
