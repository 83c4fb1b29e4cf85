//! OpenAI-compatible streaming chat backend
//!
//! Speaks the `/chat/completions` SSE dialect, which most gateway deployments
//! expose regardless of the model behind them. Text deltas stream as they
//! arrive; tool calls accumulate across deltas and are emitted once the model
//! finishes requesting them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use edgevoice_core::llm::{ChatRequest, LlmChunk, Message, Role, TokenUsage, ToolCall};
use edgevoice_core::{LlmEngine, Provider, ProviderKind};

use crate::LlmError;

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL up to and including the API version, e.g.
    /// `https://gateway.internal/v1`
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    /// Cold-path dial retries
    pub max_retries: u32,
    /// Backoff base; the n-th retry waits `n * initial_backoff`
    pub initial_backoff: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1".to_string(),
            api_key: None,
            model: "qwen2.5-7b-instruct".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    /// POST the completion request, retrying transient dial failures.
    async fn send_request(&self, request: &ChatRequest) -> Result<reqwest::Response, LlmError> {
        let body = ApiRequest::from_chat(&self.config.model, request);

        let mut attempt = 0u32;
        loop {
            let mut builder = self.client.post(self.url("/chat/completions")).json(&body);
            if let Some(key) = &self.config.api_key {
                builder = builder.bearer_auth(key);
            }

            let result: Result<reqwest::Response, LlmError> = match builder.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    Err(LlmError::Upstream { status, body })
                }
                Err(e) => Err(LlmError::Request(e.to_string())),
            };

            let err = result.unwrap_err();
            attempt += 1;
            if attempt > self.config.max_retries || !err.is_retryable() {
                return Err(err);
            }
            let backoff = self.config.initial_backoff * attempt;
            tracing::warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "llm dial failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[async_trait]
impl Provider for OpenAiBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Llm
    }

    async fn health_check(&self) -> edgevoice_core::Result<()> {
        let mut builder = self.client.get(self.url("/models"));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| edgevoice_core::Error::transport("llm.health", e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(edgevoice_core::Error::platform(
                "llm.health",
                format!("status {}", response.status()),
            ))
        }
    }
}

impl LlmEngine for OpenAiBackend {
    fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> BoxStream<'static, edgevoice_core::Result<LlmChunk>> {
        let backend = self.clone();
        Box::pin(async_stream::stream! {
            let started = Instant::now();
            let session_id = request.session_id.clone();

            let response = match backend.send_request(&request).await {
                Ok(r) => r,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };

            let mut body = response.bytes_stream();
            let mut line_buf = String::new();
            let mut full_text = String::new();
            let mut usage = TokenUsage::default();
            let mut tool_acc: BTreeMap<u32, ToolCallAccumulator> = BTreeMap::new();
            let mut tools_flushed = false;
            let mut flushed_tools: Vec<ToolCall> = Vec::new();

            'read: while let Some(next) = body.next().await {
                let bytes = match next {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(LlmError::Request(e.to_string()).into());
                        return;
                    }
                };
                line_buf.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = line_buf.find('\n') {
                    let line: String = line_buf.drain(..=pos).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'read;
                    }

                    let event: StreamEvent = match serde_json::from_str(data) {
                        Ok(ev) => ev,
                        Err(e) => {
                            yield Err(LlmError::Protocol(format!("{e}: {data}")).into());
                            return;
                        }
                    };

                    if let Some(u) = event.usage {
                        usage = TokenUsage {
                            prompt_tokens: u.prompt_tokens,
                            completion_tokens: u.completion_tokens,
                        };
                    }

                    let Some(choice) = event.choices.into_iter().next() else {
                        continue;
                    };

                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            full_text.push_str(&content);
                            yield Ok(LlmChunk::TextDelta(content));
                        }
                    }

                    for delta in choice.delta.tool_calls {
                        let acc = tool_acc.entry(delta.index).or_default();
                        if let Some(id) = delta.id {
                            acc.id = id;
                        }
                        if let Some(f) = delta.function {
                            if let Some(name) = f.name {
                                acc.name = name;
                            }
                            if let Some(args) = f.arguments {
                                acc.arguments.push_str(&args);
                            }
                        }
                    }

                    // The model stops producing text while tools are pending;
                    // flush the accumulated calls at the finish marker.
                    if choice.finish_reason.as_deref() == Some("tool_calls") && !tools_flushed {
                        tools_flushed = true;
                        for (_, acc) in std::mem::take(&mut tool_acc) {
                            let call = acc.into_call();
                            flushed_tools.push(call.clone());
                            yield Ok(LlmChunk::ToolCall(call));
                        }
                    }
                }
            }

            // Stream ended without an explicit finish marker.
            if !tools_flushed {
                for (_, acc) in std::mem::take(&mut tool_acc) {
                    let call = acc.into_call();
                    flushed_tools.push(call.clone());
                    yield Ok(LlmChunk::ToolCall(call));
                }
            }

            tracing::debug!(
                session_id = %session_id,
                chars = full_text.len(),
                tool_calls = flushed_tools.len(),
                spent_ms = started.elapsed().as_millis() as u64,
                "llm stream complete"
            );

            yield Ok(LlmChunk::Final {
                full_text,
                tool_calls: flushed_tools,
                usage,
                spent_ms: started.elapsed().as_millis() as u64,
            });
        })
    }
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_call(self) -> ToolCall {
        ToolCall {
            id: self.id,
            name: self.name,
            arguments: self.arguments,
        }
    }
}

// Wire types

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl ApiRequest {
    fn from_chat(model: &str, request: &ChatRequest) -> Self {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| ApiTool {
                        kind: "function",
                        function: ApiFunctionDef {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };
        Self {
            model: model.to_string(),
            messages: request.messages.iter().map(ApiMessage::from).collect(),
            stream: true,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
}

impl From<&Message> for ApiMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|c| ApiToolCall {
                        id: c.id.clone(),
                        kind: "function",
                        function: ApiFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        };
        Self {
            role,
            content: msg.content.clone(),
            tool_call_id: msg.tool_call_id.clone(),
            tool_calls,
        }
    }
}

#[derive(Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ApiFunctionDef,
}

#[derive(Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: ApiFunctionCall,
}

#[derive(Serialize)]
struct ApiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgevoice_core::llm::ToolDefinition;

    #[test]
    fn request_serializes_tools_and_results() {
        let request = ChatRequest::new("s1")
            .with_message(Message::system("be brief"))
            .with_message(Message::user("几点了"))
            .with_message(Message::assistant_tool_calls(vec![ToolCall {
                id: "call_1".into(),
                name: "time".into(),
                arguments: "{}".into(),
            }]))
            .with_message(Message::tool_result("call_1", "14:30"))
            .with_tools(vec![ToolDefinition {
                name: "time".into(),
                description: "current time".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }]);

        let api = ApiRequest::from_chat("m", &request);
        let json = serde_json::to_value(&api).unwrap();

        assert_eq!(json["messages"][2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(json["messages"][3]["role"], "tool");
        assert_eq!(json["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(json["tools"][0]["function"]["name"], "time");
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn delta_event_parses() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"time","arguments":"{"}}]},"finish_reason":null}]}"#;
        let event: StreamEvent = serde_json::from_str(data).unwrap();
        let delta = &event.choices[0].delta.tool_calls[0];
        assert_eq!(delta.id.as_deref(), Some("call_1"));
        assert_eq!(
            delta.function.as_ref().unwrap().arguments.as_deref(),
            Some("{")
        );
    }
}
