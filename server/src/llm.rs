//! Chat-completion client used for the conversational turn.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    config::OpenAiSettings,
    error::{AppError, AppResult},
    tools::ToolCall,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub history: Vec<ChatMessage>,
    pub user: String,
    pub tools: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> AppResult<ChatCompletion>;

    fn model_name(&self) -> &str;
}

pub struct OpenAiChatModel {
    client: reqwest::Client,
    settings: OpenAiSettings,
}

impl OpenAiChatModel {
    pub fn new(client: reqwest::Client, settings: OpenAiSettings) -> Self {
        Self { client, settings }
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(json!({ "role": "system", "content": request.system }));
        for message in &request.history {
            messages.push(json!({ "role": message.role, "content": message.content }));
        }
        messages.push(json!({ "role": "user", "content": request.user }));

        let mut body = json!({
            "model": self.settings.model,
            "messages": messages,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
        });
        if request.tools.as_array().is_some_and(|tools| !tools.is_empty()) {
            body["tools"] = request.tools.clone();
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, request: ChatRequest) -> AppResult<ChatCompletion> {
        let Some(api_key) = self.settings.api_key.as_deref() else {
            return Err(AppError::Llm("OPENAI_API_KEY not configured".to_string()));
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.settings.base_url))
            .bearer_auth(api_key)
            .json(&self.request_body(&request))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Llm(format!("openai returned {status}: {body}")));
        }
        let payload = response.json::<Value>().await?;
        let completion = parse_completion(&payload);
        debug!(
            model = %self.settings.model,
            tools = completion.tool_calls.len(),
            content_len = completion.content.len(),
            "chat completion received"
        );
        Ok(completion)
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}

pub fn parse_completion(payload: &Value) -> ChatCompletion {
    let message = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"));

    let content = message
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();

    let tool_calls = message
        .and_then(|msg| msg.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let name = function.get("name").and_then(Value::as_str)?;
                    let arguments = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    ToolCall::parse(name, arguments)
                })
                .collect()
        })
        .unwrap_or_default();

    ChatCompletion { content, tool_calls }
}

fn strings_from_array(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Splits a model answer into WhatsApp-sized messages.
///
/// A JSON array of strings (optionally fenced) wins; otherwise multi-line text is
/// split per line and anything else is a single message.
pub fn parse_reply_messages(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return vec![];
    }

    let mut candidates = vec![trimmed.to_string()];
    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    for candidate in &candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        if let Some(messages) = strings_from_array(&parsed) {
            if !messages.is_empty() {
                return messages;
            }
        }
    }

    if trimmed.starts_with('[') {
        warn!("model reply looked like a json array but did not parse");
    }

    let lines: Vec<String> = trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if lines.len() > 1 {
        lines
    } else {
        vec![trimmed.to_string()]
    }
}
