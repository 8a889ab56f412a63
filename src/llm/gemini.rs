//! Gemini and Imagen over the public REST API.

use std::{
    io::{BufRead, BufReader},
    sync::{Arc, Mutex},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use reqwest::{
    blocking::{Client, Response},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::sys::{
    llm::{
        ChatBackend, ChatChunk, ChatConfig, ChatSession, ChatStream, LlmError, Portrait,
        PortraitGenerator, ProfileGenerator, Role,
    },
    NpcProfile,
};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_IMAGE_MODEL: &str = "imagen-4.0-generate-001";
const PORTRAIT_ASPECT_RATIO: &str = "3:4";
const PORTRAIT_MIME: &str = "image/png";

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct GeminiOptions {
    #[serde(default)]
    pub api_base: String,
    #[serde(default)]
    pub text_model: String,
    #[serde(default)]
    pub chat_model: String,
    #[serde(default)]
    pub image_model: String,
}

impl GeminiOptions {
    pub fn fill_default_value(&mut self) {
        if self.api_base.is_empty() {
            self.api_base = DEFAULT_API_BASE.to_string();
        }
        if self.text_model.is_empty() {
            self.text_model = DEFAULT_TEXT_MODEL.to_string();
        }
        if self.chat_model.is_empty() {
            self.chat_model = self.text_model.clone();
        }
        if self.image_model.is_empty() {
            self.image_model = DEFAULT_IMAGE_MODEL.to_string();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<Role>, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part {
                text: Some(text.into()),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    response_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Serialize)]
struct PredictRequest {
    instances: Vec<Instance>,
    parameters: PredictParameters,
}

#[derive(Serialize)]
struct Instance {
    prompt: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    sample_count: u32,
    aspect_ratio: &'static str,
    output_options: OutputOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputOptions {
    mime_type: &'static str,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    bytes_base64_encoded: Option<String>,
    mime_type: Option<String>,
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
}

impl ErrorBody {
    fn into_error(self, fallback_status: u16) -> LlmError {
        let message = self.message.unwrap_or_default();
        LlmError::Status {
            status: self.code.unwrap_or(fallback_status),
            message: match self.status {
                Some(status) if !status.is_empty() => format!("{status}: {message}"),
                _ => message,
            },
        }
    }
}

fn map_http_error(status: StatusCode, body: String) -> LlmError {
    match serde_json::from_str::<ErrorWrapper>(&body) {
        Ok(wrapper) => wrapper.error.into_error(status.as_u16()),
        Err(_) => LlmError::Status {
            status: status.as_u16(),
            message: body,
        },
    }
}

/// JSON schema for the profile: six strings, all required.
fn profile_schema() -> serde_json::Value {
    let properties: serde_json::Map<String, serde_json::Value> = NpcProfile::FIELDS
        .iter()
        .map(|field| (field.to_string(), json!({ "type": "STRING" })))
        .collect();
    json!({
        "type": "OBJECT",
        "properties": properties,
        "required": NpcProfile::FIELDS,
        "propertyOrdering": NpcProfile::FIELDS,
    })
}

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    api_key: String,
    options: GeminiOptions,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, mut options: GeminiOptions) -> Result<Self, LlmError> {
        options.fill_default_value();
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            // slow generations and long streams run to completion
            .timeout(None)
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            options,
        })
    }

    pub fn options(&self) -> &GeminiOptions {
        &self.options
    }

    fn post<B: Serialize + ?Sized>(
        &self,
        model: &str,
        method: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> Result<Response, LlmError> {
        let url = format!(
            "{}/{model}:{method}",
            self.options.api_base.trim_end_matches('/')
        );
        log::debug!("POST {url}");

        let response = self
            .http
            .post(url)
            .query(query)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(map_http_error(status, body));
        }
        Ok(response)
    }
}

impl ProfileGenerator for GeminiClient {
    fn generate_profile(&self, prompt: &str) -> Result<NpcProfile, LlmError> {
        let contents = [Content::text(Some(Role::User), prompt)];
        let request = GenerateContentRequest {
            contents: &contents,
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_mime_type: "application/json",
                response_schema: profile_schema(),
            }),
        };

        let response: GenerateContentResponse = self
            .post(&self.options.text_model, "generateContent", &[], &request)?
            .json()
            .map_err(|e| LlmError::Schema(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(error.into_error(500));
        }

        let text = response.text();
        if text.trim().is_empty() {
            let reason = response
                .candidates
                .first()
                .and_then(|c| c.finish_reason.clone())
                .unwrap_or_else(|| "no candidates".to_string());
            return Err(LlmError::Empty(reason));
        }
        log::debug!("profile json: {text}");
        NpcProfile::from_json(&text)
    }
}

impl PortraitGenerator for GeminiClient {
    fn generate_portrait(&self, prompt: &str) -> Result<Portrait, LlmError> {
        let request = PredictRequest {
            instances: vec![Instance {
                prompt: prompt.to_string(),
            }],
            parameters: PredictParameters {
                sample_count: 1,
                aspect_ratio: PORTRAIT_ASPECT_RATIO,
                output_options: OutputOptions {
                    mime_type: PORTRAIT_MIME,
                },
            },
        };

        let response: PredictResponse = self
            .post(&self.options.image_model, "predict", &[], &request)?
            .json()
            .map_err(|e| LlmError::Schema(e.to_string()))?;

        let prediction = response
            .predictions
            .into_iter()
            .find(|p| p.bytes_base64_encoded.is_some())
            .ok_or_else(|| LlmError::Empty("no image returned".to_string()))?;
        let data = prediction.bytes_base64_encoded.unwrap_or_default();
        let bytes = BASE64_STANDARD
            .decode(data.trim())
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        Ok(Portrait {
            mime_type: prediction
                .mime_type
                .unwrap_or_else(|| PORTRAIT_MIME.to_string()),
            bytes,
        })
    }
}

impl ChatBackend for GeminiClient {
    fn create(&self, config: ChatConfig) -> Result<Arc<dyn ChatSession>, LlmError> {
        log::info!("chat session on `{}`", config.model);
        Ok(Arc::new(GeminiChat {
            client: self.clone(),
            config,
            history: Mutex::new(Vec::new()),
        }))
    }
}

pub struct GeminiChat {
    client: GeminiClient,
    config: ChatConfig,
    history: Mutex<Vec<Content>>,
}

impl ChatSession for GeminiChat {
    fn send_message_stream(&self, text: &str) -> Result<ChatStream<'_>, LlmError> {
        let user = Content::text(Some(Role::User), text);
        let mut contents = self
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        contents.push(user.clone());

        let request = GenerateContentRequest {
            contents: &contents,
            system_instruction: Some(Content::text(None, self.config.system_instruction.as_str())),
            generation_config: None,
        };
        let response = self.client.post(
            &self.config.model,
            "streamGenerateContent",
            &[("alt", "sse")],
            &request,
        )?;

        Ok(Box::new(RecordingStream {
            inner: SseChunks::new(BufReader::new(response)),
            history: &self.history,
            user: Some(user),
            reply: String::new(),
            done: false,
        }))
    }
}

/// Parses `data:` lines of a server-sent event stream into chunks.
pub struct SseChunks<R> {
    lines: std::io::Lines<R>,
}

impl<R: BufRead> SseChunks<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

impl<R: BufRead> Iterator for SseChunks<R> {
    type Item = Result<ChatChunk, LlmError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            let response = match serde_json::from_str::<GenerateContentResponse>(data) {
                Ok(response) => response,
                Err(e) => return Some(Err(LlmError::Schema(e.to_string()))),
            };
            if let Some(error) = response.error {
                return Some(Err(error.into_error(500)));
            }
            return Some(Ok(ChatChunk {
                text: response.text(),
            }));
        }
    }
}

/// Appends the turn to the history once the reply has been read in full.
struct RecordingStream<'a, I> {
    inner: I,
    history: &'a Mutex<Vec<Content>>,
    user: Option<Content>,
    reply: String,
    done: bool,
}

impl<I> Iterator for RecordingStream<'_, I>
where
    I: Iterator<Item = Result<ChatChunk, LlmError>>,
{
    type Item = Result<ChatChunk, LlmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok(chunk)) => {
                self.reply.push_str(&chunk.text);
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                if let Some(user) = self.user.take() {
                    let reply = std::mem::take(&mut self.reply);
                    let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
                    history.push(user);
                    history.push(Content::text(Some(Role::Model), reply));
                }
                None
            }
        }
    }
}
