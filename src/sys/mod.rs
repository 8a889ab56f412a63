use llm::LlmError;

pub mod llm;
pub mod prompt;

/// The character on the other side of the plant.
///
/// Created once per session from the profile-generation response and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NpcProfile {
    pub name: String,
    pub personality: String,
    pub backstory: String,
    pub current_activity: String,
    pub image_prompt: String,
    pub first_message: String,
}

impl NpcProfile {
    pub const FIELDS: [&'static str; 6] = [
        "name",
        "personality",
        "backstory",
        "current_activity",
        "image_prompt",
        "first_message",
    ];

    /// Missing, extra or non-string fields are a schema error, not a transport one.
    pub fn from_json(text: &str) -> Result<Self, LlmError> {
        serde_json::from_str(text.trim()).map_err(|e| LlmError::Schema(e.to_string()))
    }
}
