use std::sync::Arc;

use super::NpcProfile;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("service answered {status}: {message}")]
    Status { status: u16, message: String },

    /// The response arrived but does not match the expected shape.
    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("stream interrupted: {0}")]
    Stream(#[from] std::io::Error),

    #[error("empty response: {0}")]
    Empty(String),

    #[error("prompt template: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("image decode: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "model")]
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    pub model: String,
    pub system_instruction: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatChunk {
    pub text: String,
}

/// Lazily produced reply fragments. Their concatenation is the whole reply.
pub type ChatStream<'a> = Box<dyn Iterator<Item = Result<ChatChunk, LlmError>> + Send + 'a>;

#[derive(Debug, Clone)]
pub struct Portrait {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Structured profile generation. The implementation owns the response schema.
pub trait ProfileGenerator: Send + Sync {
    fn generate_profile(&self, prompt: &str) -> Result<NpcProfile, LlmError>;
}

pub trait PortraitGenerator: Send + Sync {
    fn generate_portrait(&self, prompt: &str) -> Result<Portrait, LlmError>;
}

pub trait ChatBackend: Send + Sync {
    fn create(&self, config: ChatConfig) -> Result<Arc<dyn ChatSession>, LlmError>;
}

/// A multi-turn conversation; history lives inside the handle.
pub trait ChatSession: Send + Sync {
    fn send_message_stream(&self, text: &str) -> Result<ChatStream<'_>, LlmError>;
}

/// The three collaborators the session talks to.
#[derive(Clone)]
pub struct Backends {
    pub profiles: Arc<dyn ProfileGenerator>,
    pub chats: Arc<dyn ChatBackend>,
    pub portraits: Arc<dyn PortraitGenerator>,
    pub chat_model: String,
}
