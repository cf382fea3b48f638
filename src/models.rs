//! Wire types for both sides of the gateway
//!
//! The inbound side mimics the OpenAI chat completions API; the outbound side is the subset of
//! the AI Horde v2 text generation API the gateway talks to.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Request body for POST /v1/chat/completions.
///
/// `model` and `messages` are optional at the serde level so that their absence is reported as a
/// malformed request rather than a deserialization failure.
///
/// Generation overrides are kept as raw JSON and forwarded as given. `None` means the key was
/// absent; an explicit `null` is `Some(Value::Null)`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default, deserialize_with = "present")]
    pub max_tokens: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub temperature: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub top_p: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub top_k: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub seed: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            content: Some(MessageContent::Text(content.into())),
        }
    }
}

/// Message content - either a string or array of content parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flattens the content to plain text. Non-text parts carry nothing the horde can use.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Other => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Response body for POST /v1/chat/completions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

/// Approximate usage: whitespace-separated word counts, not real tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn approximate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = prompt.split_whitespace().count();
        let completion_tokens = completion.split_whitespace().count();
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl ChatResponse {
    /// Wraps a finished horde generation into a chat completion.
    ///
    /// `model` is the name the caller asked for, not the models the job ran against.
    pub fn from_generation(job_id: &str, model: &str, prompt: &str, text: String) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        ChatResponse {
            id: format!("chatcmpl-{job_id}"),
            object: "chat.completion".into(),
            created,
            model: model.to_owned(),
            usage: Usage::approximate(prompt, &text),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".into(),
                    content: text,
                },
                logprobs: None,
                finish_reason: "stop".into(),
            }],
        }
    }
}

/// Body of POST /generate/text/async.
#[derive(Debug, Clone, Serialize)]
pub struct HordeGenerationRequest<'a> {
    pub prompt: &'a str,
    pub params: &'a serde_json::Map<String, serde_json::Value>,
    pub models: &'a [String],
    /// Top-level request settings such as `trusted_workers` or `nsfw`.
    #[serde(flatten)]
    pub settings: &'a serde_json::Map<String, serde_json::Value>,
}

/// Response of POST /generate/text/async.
#[derive(Debug, Clone, Deserialize)]
pub struct HordeAsyncResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kudos: Option<f64>,
}

/// Response of GET /generate/text/status/{id}.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HordeJobStatus {
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub faulted: bool,
    #[serde(default)]
    pub wait_time: Option<f64>,
    #[serde(default)]
    pub queue_position: Option<f64>,
    #[serde(default)]
    pub generations: Vec<HordeGeneration>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HordeGeneration {
    pub text: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub worker_name: Option<String>,
}
