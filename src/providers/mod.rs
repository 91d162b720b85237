pub mod anthropic;
pub mod dify;
pub mod dispatch;
pub mod engine;
pub mod ollama;
pub mod openai;

use crate::tools::ToolRegistry;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API error during {operation}: {message}")]
    Api {
        provider: &'static str,
        operation: &'static str,
        message: String,
    },
    #[error("{0} API key is required")]
    MissingApiKey(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("model requested unknown tool '{0}'")]
    UnknownTool(String),
    #[error("tool '{name}' failed: {message}")]
    ToolFailed { name: String, message: String },
    #[error("step limit of {limit} reached with finish reason {finish_reason:?}")]
    StepLimitExceeded {
        limit: u32,
        finish_reason: FinishReason,
    },
    #[error("malformed model output: {message}")]
    MalformedOutput { message: String, raw: String },
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// Closed set of provider integrations. Every kind is handled exhaustively
/// in dispatch, key mapping and validation; adding a provider means adding
/// a variant and fixing the resulting match errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
    Openai,
    Google,
    Perplexity,
    Mistral,
    Azure,
    Openrouter,
    Xai,
    Ollama,
    Bedrock,
    DifyAgent,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 11] = [
        ProviderKind::Anthropic,
        ProviderKind::Openai,
        ProviderKind::Google,
        ProviderKind::Perplexity,
        ProviderKind::Mistral,
        ProviderKind::Azure,
        ProviderKind::Openrouter,
        ProviderKind::Xai,
        ProviderKind::Ollama,
        ProviderKind::Bedrock,
        ProviderKind::DifyAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
            ProviderKind::Google => "google",
            ProviderKind::Perplexity => "perplexity",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Azure => "azure",
            ProviderKind::Openrouter => "openrouter",
            ProviderKind::Xai => "xai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::DifyAgent => "difyagent",
        }
    }

    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Openai => Some("OPENAI_API_KEY"),
            ProviderKind::Google => Some("GOOGLE_API_KEY"),
            ProviderKind::Perplexity => Some("PERPLEXITY_API_KEY"),
            ProviderKind::Mistral => Some("MISTRAL_API_KEY"),
            ProviderKind::Azure => Some("AZURE_OPENAI_API_KEY"),
            ProviderKind::Openrouter => Some("OPENROUTER_API_KEY"),
            ProviderKind::Xai => Some("XAI_API_KEY"),
            ProviderKind::Ollama => None,
            ProviderKind::Bedrock => None,
            ProviderKind::DifyAgent => Some("DIFY_AGENT_API_KEY"),
        }
    }

    pub fn base_url_env(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_BASE_URL",
            ProviderKind::Openai => "OPENAI_BASE_URL",
            ProviderKind::Google => "GOOGLE_BASE_URL",
            ProviderKind::Perplexity => "PERPLEXITY_BASE_URL",
            ProviderKind::Mistral => "MISTRAL_BASE_URL",
            ProviderKind::Azure => "AZURE_OPENAI_BASE_URL",
            ProviderKind::Openrouter => "OPENROUTER_BASE_URL",
            ProviderKind::Xai => "XAI_BASE_URL",
            ProviderKind::Ollama => "OLLAMA_BASE_URL",
            ProviderKind::Bedrock => "BEDROCK_BASE_URL",
            ProviderKind::DifyAgent => "DIFY_AGENT_BASE_URL",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        self.api_key_env().is_some()
    }

    /// Catalog-validated providers must also exist in the model catalog;
    /// the rest are "custom" providers (local inference, credential-less,
    /// agent platform) that bypass catalog validation.
    pub fn is_catalog_validated(&self) -> bool {
        !matches!(
            self,
            ProviderKind::Ollama | ProviderKind::Bedrock | ProviderKind::DifyAgent
        )
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ProviderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        ProviderKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == lower)
            .ok_or_else(|| ProviderError::UnknownProvider(s.to_string()))
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }
    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            name: Some(call.name.clone()),
            tool_call_id: call.id.clone(),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ToolResultRecord {
    pub name: String,
    pub tool_call_id: Option<String>,
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Option<Usage>) {
        if let Some(u) = other {
            self.input_tokens += u.input_tokens;
            self.output_tokens += u.output_tokens;
            self.total_tokens += u.total_tokens;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    #[default]
    Unknown,
}

/// Outcome of a single vendor round trip: final text, or tool calls to run.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Default)]
pub struct ChatDelta {
    pub delta: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
}

pub type ChatStream = BoxStream<'static, Result<ChatDelta, ProviderError>>;

/// Unified parameter shape every adapter accepts.
#[derive(Debug, Clone, Default)]
pub struct InvocationParams {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolSpec>,
    pub active_tools: Option<Vec<String>>,
    pub schema: Option<serde_json::Value>,
    pub object_name: Option<String>,
    pub command_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerateTextResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub steps: u32,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResultRecord>,
}

#[derive(Debug, Clone)]
pub struct GenerateObjectResult {
    pub object: serde_json::Value,
    pub usage: Usage,
    /// True when the object only parsed after a repair pass, so callers can
    /// tell "unparsable, repaired" from clean output.
    pub repaired: bool,
}

// Single funnel for vendor failures: log, then re-raise the normalized
// shape. Callers never see raw reqwest/serde errors.
pub(crate) fn handle_error(
    provider: &'static str,
    operation: &'static str,
    error: impl std::fmt::Display,
) -> ProviderError {
    let message = error.to_string();
    tracing::error!("{provider} {operation} failed: {message}");
    ProviderError::Api {
        provider,
        operation,
        message,
    }
}

pub(crate) fn validate_params(
    provider: &'static str,
    params: &InvocationParams,
) -> Result<(), ProviderError> {
    if params.model_id.is_empty() {
        return Err(ProviderError::InvalidRequest(format!(
            "{provider} model ID is required"
        )));
    }
    if let Some(t) = params.temperature
        && !(0.0..=1.0).contains(&t)
    {
        return Err(ProviderError::InvalidRequest(
            "temperature must be between 0 and 1".into(),
        ));
    }
    if let Some(mt) = params.max_tokens
        && mt == 0
    {
        return Err(ProviderError::InvalidRequest(
            "maxTokens must be greater than 0".into(),
        ));
    }
    validate_messages(&params.messages)
}

pub(crate) fn validate_messages(messages: &[ChatMessage]) -> Result<(), ProviderError> {
    if messages.is_empty() {
        return Err(ProviderError::InvalidRequest(
            "invalid or empty messages array provided".into(),
        ));
    }
    for m in messages {
        let role_ok = matches!(m.role.as_str(), "system" | "user" | "assistant" | "tool");
        let content_ok = !m.content.is_empty() || m.tool_calls.is_some();
        if !role_ok || !content_ok {
            return Err(ProviderError::InvalidRequest(
                "invalid message format: each message must have a role and content".into(),
            ));
        }
    }
    Ok(())
}

// Splits an SSE response into the payloads of its `data:` lines, buffering
// across chunk boundaries. Empty payloads and the [DONE] sentinel are dropped.
pub(crate) fn sse_data_lines(
    resp: reqwest::Response,
) -> impl futures_util::Stream<Item = Result<String, reqwest::Error>> + Send + 'static {
    let bytes = Box::pin(resp.bytes_stream().fuse());
    futures_util::stream::unfold(
        (bytes, String::new(), std::collections::VecDeque::<String>::new()),
        |(mut bytes, mut buf, mut pending)| async move {
            loop {
                if let Some(line) = pending.pop_front() {
                    return Some((Ok(line), (bytes, buf, pending)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buf.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buf.find('\n') {
                            let line: String = buf.drain(..=pos).collect();
                            if let Some(data) = data_payload(&line) {
                                pending.push_back(data);
                            }
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), (bytes, buf, pending))),
                    None => {
                        let tail = std::mem::take(&mut buf);
                        return data_payload(&tail).map(|data| (Ok(data), (bytes, buf, pending)));
                    }
                }
            }
        },
    )
}

// The tool allow-list restricts which of the advertised specs a model may
// actually see for this call.
pub(crate) fn active_tool_specs(params: &InvocationParams) -> Vec<&ToolSpec> {
    params
        .tools
        .iter()
        .filter(|t| {
            params
                .active_tools
                .as_ref()
                .is_none_or(|active| active.iter().any(|n| n == &t.name))
        })
        .collect()
}

fn data_payload(line: &str) -> Option<String> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data.to_string())
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Environment variable carrying this provider's key, or None for
    /// credential-less providers.
    fn required_api_key_name(&self) -> Option<&'static str>;

    fn api_key(&self) -> Option<&str> {
        None
    }

    /// Credential-less providers inherit this and pass by returning None
    /// from `required_api_key_name`.
    fn validate_auth(&self, params: &InvocationParams) -> Result<(), ProviderError> {
        let _ = params;
        if self.required_api_key_name().is_some() && self.api_key().is_none_or(str::is_empty) {
            return Err(ProviderError::MissingApiKey(self.name()));
        }
        Ok(())
    }

    /// One blocking model call. May return tool calls instead of final text.
    async fn chat_step(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
    ) -> Result<StepOutcome, ProviderError>;

    /// One streaming model call; deltas arrive as the vendor emits them.
    async fn chat_stream(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
    ) -> Result<ChatStream, ProviderError>;

    async fn generate_text(
        &self,
        params: &InvocationParams,
        tools: &ToolRegistry,
    ) -> Result<GenerateTextResult, ProviderError> {
        engine::generate_text(self, params, tools).await
    }

    async fn stream_text(&self, params: &InvocationParams) -> Result<ChatStream, ProviderError> {
        engine::stream_text(self, params).await
    }

    async fn generate_object(
        &self,
        params: &InvocationParams,
    ) -> Result<GenerateObjectResult, ProviderError> {
        engine::generate_object(self, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn provider_kind_round_trips_through_strings() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(ProviderKind::from_str("not-a-real-provider").is_err());
    }

    #[test]
    fn credential_less_providers_have_no_key_env() {
        assert!(ProviderKind::Ollama.api_key_env().is_none());
        assert!(ProviderKind::Bedrock.api_key_env().is_none());
        assert_eq!(
            ProviderKind::DifyAgent.api_key_env(),
            Some("DIFY_AGENT_API_KEY")
        );
    }

    #[test]
    fn validate_params_rejects_bad_input() {
        let ok = InvocationParams {
            model_id: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            ..Default::default()
        };
        assert!(validate_params("test", &ok).is_ok());

        let mut missing_model = ok.clone();
        missing_model.model_id.clear();
        assert!(validate_params("test", &missing_model).is_err());

        let mut bad_temp = ok.clone();
        bad_temp.temperature = Some(1.5);
        assert!(validate_params("test", &bad_temp).is_err());

        let mut zero_tokens = ok.clone();
        zero_tokens.max_tokens = Some(0);
        assert!(validate_params("test", &zero_tokens).is_err());

        let mut empty = ok.clone();
        empty.messages.clear();
        assert!(validate_params("test", &empty).is_err());

        let mut bad_role = ok;
        bad_role.messages.push(ChatMessage {
            role: "narrator".into(),
            content: "x".into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        });
        assert!(validate_params("test", &bad_role).is_err());
    }
}
