use super::{
    AiProvider, ChatDelta, ChatMessage, ChatStream, FinishReason, GenerateObjectResult,
    InvocationParams, ProviderError, StepOutcome, Usage, handle_error, sse_data_lines,
    validate_params,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const DEFAULT_USER: &str = "taskmaster";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Dify's chat-messages API is query/answer oriented rather than a full
// message-array chat API: the first system message rides along as
// `inputs.prompt` and the last user message becomes the `query`. Answers
// arrive as an SSE stream of JSON events.
pub struct DifyProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    user: String,
}

impl DifyProvider {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url,
            api_key,
            user: DEFAULT_USER.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat-messages", self.base_url.trim_end_matches('/'))
    }

    fn body(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
        response_mode: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        let Some(query) = extract_query(messages) else {
            return Err(ProviderError::InvalidRequest(
                "difyagent query (from messages) is required".into(),
            ));
        };
        if !params.tools.is_empty() {
            tracing::warn!(
                "difyagent runs its own agent tools server-side; ignoring {} local tool spec(s)",
                params.tools.len()
            );
        }
        let mut inputs = serde_json::Map::new();
        if let Some(prompt) = extract_prompt(messages) {
            inputs.insert("prompt".into(), json!(prompt));
        }
        let mut body = json!({
            "inputs": inputs,
            "query": query,
            "response_mode": response_mode,
            "conversation_id": "",
            "user": self.user,
        });
        if let Some(schema) = &params.schema {
            body["schema"] = schema.clone();
        }
        Ok(body)
    }

    fn request(&self, blocking: bool) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.api_key.as_deref().unwrap_or_default());
        if blocking {
            req = req.timeout(REQUEST_TIMEOUT);
        }
        req
    }
}

/// First system message, if any, becomes part of `inputs`.
fn extract_prompt(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .find(|m| m.role == "system" && !m.content.is_empty())
        .map(|m| m.content.as_str())
}

/// Last user message becomes the query.
fn extract_query(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user" && !m.content.is_empty())
        .map(|m| m.content.as_str())
}

#[derive(Debug, Deserialize, Default)]
struct Metadata {
    usage: Option<DifyUsage>,
}

#[derive(Debug, Deserialize, Default)]
struct DifyUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl DifyUsage {
    fn into_usage(self) -> Usage {
        let input = self.prompt_tokens.unwrap_or(0);
        let output = self.completion_tokens.unwrap_or(0);
        Usage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: self.total_tokens.unwrap_or(input + output),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
enum Event {
    #[serde(rename = "message")]
    Message { answer: Option<String> },
    #[serde(rename = "agent_message")]
    AgentMessage { answer: Option<String> },
    #[serde(rename = "agent_thought")]
    AgentThought {
        thought: Option<String>,
        tool: Option<String>,
    },
    #[serde(rename = "message_file")]
    MessageFile { url: Option<String> },
    #[serde(rename = "message_end")]
    MessageEnd {
        conversation_id: Option<String>,
        metadata: Option<Metadata>,
    },
    #[serde(rename = "error")]
    ErrorEvent { message: Option<String> },
    #[serde(other)]
    Other,
}

// A single malformed line must not fail the whole call.
fn parse_event(data: &str) -> Option<Event> {
    match serde_json::from_str(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("difyagent: skipping unparseable stream chunk ({e}): {data}");
            None
        }
    }
}

#[derive(Default)]
struct StreamState {
    answer: String,
    usage: Option<Usage>,
    conversation_id: Option<String>,
    thoughts: u32,
}

impl StreamState {
    fn apply(&mut self, event: Event) -> Result<(), ProviderError> {
        match event {
            Event::Message { answer } | Event::AgentMessage { answer } => {
                if let Some(a) = answer {
                    self.answer.push_str(&a);
                }
            }
            Event::AgentThought { thought, tool } => {
                self.thoughts += 1;
                tracing::debug!(
                    "difyagent thought #{}: {:?} (tool: {:?})",
                    self.thoughts,
                    thought,
                    tool
                );
            }
            Event::MessageFile { url } => {
                tracing::debug!("difyagent produced a file: {url:?}");
            }
            Event::MessageEnd {
                conversation_id,
                metadata,
            } => {
                self.conversation_id = conversation_id;
                self.usage = metadata.and_then(|m| m.usage).map(DifyUsage::into_usage);
            }
            Event::ErrorEvent { message } => {
                return Err(handle_error(
                    "difyagent",
                    "text generation",
                    message.unwrap_or_else(|| "stream reported an error".into()),
                ));
            }
            Event::Other => {}
        }
        Ok(())
    }
}

#[async_trait]
impl AiProvider for DifyProvider {
    fn name(&self) -> &'static str {
        "difyagent"
    }

    fn required_api_key_name(&self) -> Option<&'static str> {
        Some("DIFY_AGENT_API_KEY")
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    async fn chat_step(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
    ) -> Result<StepOutcome, ProviderError> {
        let body = self.body(params, messages, "streaming")?;
        let resp = self
            .request(false)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| handle_error(self.name(), "text generation", e))?;

        let mut state = StreamState::default();
        let mut lines = std::pin::pin!(sse_data_lines(resp));
        while let Some(line) = lines.next().await {
            let data = line.map_err(|e| handle_error(self.name(), "text generation", e))?;
            if let Some(event) = parse_event(&data) {
                state.apply(event)?;
            }
        }
        if let Some(id) = &state.conversation_id {
            tracing::debug!("difyagent conversation id: {id}");
        }

        Ok(StepOutcome {
            text: Some(state.answer),
            tool_calls: vec![],
            usage: state.usage,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn chat_stream(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
    ) -> Result<ChatStream, ProviderError> {
        let body = self.body(params, messages, "streaming")?;
        let resp = self
            .request(false)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| handle_error(self.name(), "text streaming", e))?;

        let stream = sse_data_lines(resp)
            .map(|line| {
                let data = line.map_err(|e| handle_error("difyagent", "text streaming", e))?;
                let Some(event) = parse_event(&data) else {
                    return Ok(ChatDelta::default());
                };
                let delta = match event {
                    Event::Message { answer } | Event::AgentMessage { answer } => ChatDelta {
                        delta: answer.filter(|a| !a.is_empty()),
                        ..Default::default()
                    },
                    Event::MessageEnd { metadata, .. } => ChatDelta {
                        usage: metadata.and_then(|m| m.usage).map(DifyUsage::into_usage),
                        finish_reason: Some(FinishReason::Stop),
                        ..Default::default()
                    },
                    Event::ErrorEvent { message } => {
                        return Err(handle_error(
                            "difyagent",
                            "text streaming",
                            message.unwrap_or_else(|| "stream reported an error".into()),
                        ));
                    }
                    _ => ChatDelta::default(),
                };
                Ok(delta)
            })
            .filter(|res: &Result<ChatDelta, ProviderError>| {
                let keep = match res {
                    Ok(d) => d.delta.is_some() || d.usage.is_some() || d.finish_reason.is_some(),
                    Err(_) => true,
                };
                futures_util::future::ready(keep)
            })
            .boxed();

        Ok(stream)
    }

    // Blocking mode: the whole answer is parsed as JSON in one shot. A parse
    // failure here is a hard failure; Dify agents are not expected to emit
    // the partially-valid JSON chat models do, so no repair pass applies.
    async fn generate_object(
        &self,
        params: &InvocationParams,
    ) -> Result<GenerateObjectResult, ProviderError> {
        self.validate_auth(params)?;
        validate_params(self.name(), params)?;
        if params.schema.is_none() {
            return Err(ProviderError::InvalidRequest(
                "schema is required for object generation".into(),
            ));
        }
        if params.object_name.is_none() {
            return Err(ProviderError::InvalidRequest(
                "object name is required for object generation".into(),
            ));
        }

        #[derive(Deserialize)]
        struct BlockingResp {
            answer: Option<String>,
            metadata: Option<Metadata>,
        }

        let body = self.body(params, &params.messages, "blocking")?;
        let resp: BlockingResp = self
            .request(true)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| handle_error(self.name(), "object generation", e))?
            .json()
            .await
            .map_err(|e| handle_error(self.name(), "object generation", e))?;

        let Some(raw) = resp.answer else {
            return Err(handle_error(
                self.name(),
                "object generation",
                "response did not contain an answer",
            ));
        };
        let object = serde_json::from_str(raw.trim()).map_err(|e| {
            tracing::error!("difyagent object generation returned unparseable JSON: {e}");
            ProviderError::MalformedOutput {
                message: e.to_string(),
                raw,
            }
        })?;

        Ok(GenerateObjectResult {
            object,
            usage: resp
                .metadata
                .and_then(|m| m.usage)
                .map(DifyUsage::into_usage)
                .unwrap_or_default(),
            repaired: false,
        })
    }
}
