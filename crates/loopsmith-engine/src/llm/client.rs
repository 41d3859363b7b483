//! OpenAI-compatible chat-completions client.
//!
//! Implements [`ChatModel`] over `POST {base_url}/chat/completions` with
//! tool calling enabled. Transient failures (timeouts, connection errors,
//! 429 and 5xx) are retried with exponential backoff.

use loopsmith_core::{ChatModel, Message, ModelError, Role, ToolCallRequest, ToolDefinition};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const INITIAL_BACKOFF_MS: u64 = 1000;
pub(crate) const BACKOFF_MULTIPLIER: u64 = 2;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub request_timeout: Duration,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, settings: &ClientSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            endpoint: chat_completions_url(&settings.base_url),
            model: settings.model.clone(),
            temperature: settings.temperature,
        })
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Message, ModelError> {
        let request = ChatRequest {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            temperature: self.temperature,
            tool_choice: (!tools.is_empty()).then_some("auto"),
            tools: tools.iter().map(WireTool::from).collect(),
        };
        tracing::debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            "sending chat completion request"
        );

        let text = send_with_retry(&self.http, &self.endpoint, &self.api_key, &request).await?;
        parse_chat_response(&text)
    }
}

impl ChatModel for OpenAiClient {
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        tools: &'a [ToolDefinition],
    ) -> Pin<Box<dyn Future<Output = Result<Message, ModelError>> + Send + 'a>> {
        Box::pin(self.send(messages, tools))
    }
}

pub(crate) fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  WIRE FORMAT
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: Role,
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCallMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCallMessage {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: FunctionCallMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCallMessage {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let tool_calls = message.has_tool_calls().then(|| {
            message
                .tool_calls
                .iter()
                .map(|call| ToolCallMessage {
                    id: call.id.clone(),
                    call_type: function_type(),
                    function: FunctionCallMessage {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect()
        });
        // Assistant turns that only carry tool calls are sent with null content.
        let content = if tool_calls.is_some() && message.content.is_empty() {
            None
        } else {
            Some(message.content.clone())
        };
        WireMessage {
            role: message.role,
            content,
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: &'static str,
    description: &'static str,
    parameters: serde_json::Value,
}

impl From<&ToolDefinition> for WireTool {
    fn from(def: &ToolDefinition) -> Self {
        WireTool {
            tool_type: "function",
            function: WireFunction {
                name: def.name,
                description: def.description,
                parameters: def.parameters_schema(),
            },
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallMessage>>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Error body shape; some gateways send it with a 200 status.
#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

fn parse_chat_response(text: &str) -> Result<Message, ModelError> {
    let parsed: ChatResponse = serde_json::from_str(text).map_err(|e| {
        anyhow::anyhow!(
            "Failed to parse chat response: {}\n{}",
            e,
            sanitize_api_response(text)
        )
    })?;

    let choice = parsed.choices.into_iter().next().ok_or(ModelError::NoChoices)?;
    if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(ModelError::Refused(truncate_str(&refusal, 200).to_string()));
    }

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCallRequest {
            id: call.id,
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect();
    Ok(Message::assistant(
        choice.message.content.unwrap_or_default(),
        tool_calls,
    ))
}

// ═══════════════════════════════════════════════════════════════════════════
//  TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════

/// Send a request with automatic retry on transient failures.
///
/// Handles:
/// - Network errors (timeout, connection failures)
/// - Rate limits (429)
/// - Server errors (5xx)
/// - Gateways that answer 200 with an error body
///
/// Returns the response text on success, or an error after all retries exhausted.
pub(crate) async fn send_with_retry<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    request_body: &T,
) -> anyhow::Result<String> {
    let mut retry_count = 0;

    loop {
        let response = match client
            .post(url)
            .header("Content-Type", "application/json")
            .bearer_auth(api_key)
            .json(request_body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                    retry_count += 1;
                    tracing::warn!(retry = retry_count, "model request failed: {err}");
                    tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
                    continue;
                }
                return Err(map_transport_error(err));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                if is_retryable_network_error(&err) && retry_count < MAX_RETRIES {
                    retry_count += 1;
                    tokio::time::sleep(Duration::from_secs(backoff_secs(retry_count))).await;
                    continue;
                }
                return Err(map_transport_error(err));
            }
        };

        if status.is_success() {
            if let Ok(body) = serde_json::from_str::<ApiErrorBody>(&text) {
                return Err(anyhow::anyhow!(
                    "Model service error: {}",
                    sanitize_api_response(&body.error.message)
                ));
            }
            return Ok(text);
        }

        if (status.as_u16() == 429 || status.is_server_error()) && retry_count < MAX_RETRIES {
            retry_count += 1;
            let wait = if status.as_u16() == 429 {
                parse_retry_after(&text).unwrap_or_else(|| backoff_secs(retry_count))
            } else {
                backoff_secs(retry_count)
            };
            tracing::warn!(%status, retry = retry_count, wait_secs = wait, "retrying model request");
            tokio::time::sleep(Duration::from_secs(wait)).await;
            continue;
        }

        let error_msg = match status.as_u16() {
            401 => "Invalid API key. Check the OPENAI_API_KEY environment variable.".to_string(),
            429 => format!(
                "Rate limited by the model service after {} retries. Try again in a few minutes.",
                retry_count
            ),
            500..=599 => format!(
                "Model service error ({}). The service may be temporarily unavailable.",
                status
            ),
            _ => format!("API error {}: {}", status, sanitize_api_response(&text)),
        };
        return Err(anyhow::anyhow!("{}", error_msg));
    }
}

/// Extract a retry-after hint such as "retry after 7 seconds" from an error body.
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

pub(crate) fn backoff_secs(retry_count: u32) -> u64 {
    let factor = BACKOFF_MULTIPLIER.pow(retry_count.saturating_sub(1));
    let ms = INITIAL_BACKOFF_MS.saturating_mul(factor);
    (ms / 1000).max(1)
}

pub(crate) fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn map_transport_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() {
        anyhow::anyhow!("Model service request timed out. Please try again.")
    } else if err.is_connect() {
        anyhow::anyhow!("Could not connect to the model service. Check your network and try again.")
    } else {
        err.into()
    }
}

/// Sanitize API response content for error messages to prevent credential leakage.
fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
    ];

    let truncated = truncate_str(content, MAX_ERROR_CONTENT_LEN);
    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        return "(response details redacted - may contain sensitive data)".to_string();
    }
    truncated.to_string()
}

/// Truncate a string for display (Unicode-safe)
fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}
