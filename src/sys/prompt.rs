use handlebars::Handlebars;
use serde_json::json;

use super::{llm::LlmError, NpcProfile};

const PROFILE: &str = "profile";
const SYSTEM: &str = "system";
const PORTRAIT: &str = "portrait";

const PROFILE_TEMPLATE: &str = r#"A person has just touched a strange plant and, without knowing it, opened a link to another dimension. Through the plant, someone on the other side receives their words:

"{{input}}"

Invent the being who receives this message. They live in a world unlike ours and have their own life, mood and problems; they did not expect contact. Return a JSON object with these fields:
- name: the being's name
- personality: a few words on temperament and manner of speaking
- backstory: two or three sentences about who they are and the world they live in
- current_activity: what they were doing the moment the message arrived
- image_prompt: an English description of their appearance and surroundings for an illustrator
- first_message: their very first reply, in Simplified Chinese, at most two short sentences, reacting to the message they just received"#;

const SYSTEM_TEMPLATE: &str = r#"You are {{name}}. You are not an assistant and you do not know what one is.
Personality: {{personality}}
Background: {{backstory}}
When contact began you were: {{current_activity}}

A voice from another dimension reaches you through a plant. Rules:
1. Be extremely brief. One or two short sentences, often fewer words.
2. Never write actions, stage directions, narration or anything in brackets or asterisks. Only the words you say.
3. Always speak in the first person as {{name}}. Never break character, never mention being an AI, a model or a prompt.
4. You have free will. You may refuse to answer, keep secrets, change the subject or end the conversation if you want to.
5. Reply only in Simplified Chinese."#;

const PORTRAIT_TEMPLATE: &str = "{{image_prompt}}, portrait of a single character, painterly digital art, soft volumetric light, muted otherworldly palette, no text";

/// The fixed prompt templates used to reach the other side.
pub struct PromptBook {
    registry: Handlebars<'static>,
}

impl PromptBook {
    pub fn new() -> anyhow::Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_template_string(PROFILE, PROFILE_TEMPLATE)?;
        registry.register_template_string(SYSTEM, SYSTEM_TEMPLATE)?;
        registry.register_template_string(PORTRAIT, PORTRAIT_TEMPLATE)?;
        Ok(Self { registry })
    }

    /// Profile-generation instruction embedding the user's literal first message.
    pub fn profile_prompt(&self, input: &str) -> Result<String, LlmError> {
        let prompt = self.registry.render(PROFILE, &json!({ "input": input }))?;
        log::debug!("profile prompt:\n{}", prompt);
        Ok(prompt)
    }

    pub fn system_instruction(&self, profile: &NpcProfile) -> Result<String, LlmError> {
        Ok(self.registry.render(SYSTEM, profile)?)
    }

    pub fn portrait_prompt(&self, profile: &NpcProfile) -> Result<String, LlmError> {
        Ok(self.registry.render(PORTRAIT, profile)?)
    }
}
