use super::{
    AiProvider, ChatDelta, ChatMessage, ChatStream, FinishReason, InvocationParams, ProviderError,
    StepOutcome, ToolCall, Usage, active_tool_specs, handle_error, sse_data_lines,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl AnthropicProvider {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn request(&self, stream: bool) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let mut req = self
            .client
            .post(url)
            .header("x-api-key", self.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", API_VERSION);
        if !stream {
            req = req.timeout(REQUEST_TIMEOUT);
        }
        req
    }
}

#[derive(Serialize)]
struct ReqMsg {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct ToolDef<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a serde_json::Value,
}

#[derive(Serialize)]
struct Body<'a> {
    model: &'a str,
    messages: Vec<ReqMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef<'a>>>,
}

// Messages API wants system text at the top level; tool results travel as
// user-role tool_result blocks, assistant tool calls as tool_use blocks.
fn build_body<'a>(
    params: &'a InvocationParams,
    messages: &[ChatMessage],
    stream: bool,
) -> Body<'a> {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut out: Vec<ReqMsg> = Vec::new();
    for m in messages {
        match m.role.as_str() {
            "system" => system_parts.push(&m.content),
            "tool" => {
                if let Some(id) = &m.tool_call_id {
                    out.push(ReqMsg {
                        role: "user",
                        content: json!([{
                            "type": "tool_result",
                            "tool_use_id": id,
                            "content": m.content,
                        }]),
                    });
                }
            }
            "assistant" => {
                let mut blocks: Vec<serde_json::Value> = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": m.content}));
                }
                for call in m.tool_calls.iter().flatten() {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id.clone().unwrap_or_else(|| "toolu_0".into()),
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                if !blocks.is_empty() {
                    out.push(ReqMsg {
                        role: "assistant",
                        content: serde_json::Value::Array(blocks),
                    });
                }
            }
            _ => out.push(ReqMsg {
                role: "user",
                content: json!([{"type": "text", "text": m.content}]),
            }),
        }
    }

    let specs = active_tool_specs(params);
    let tools = (!specs.is_empty()).then(|| {
        specs
            .into_iter()
            .map(|t| ToolDef {
                name: &t.name,
                description: &t.description,
                input_schema: &t.parameters,
            })
            .collect()
    });

    Body {
        model: &params.model_id,
        messages: out,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
        max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: params.temperature,
        stream,
        tools,
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        _ => FinishReason::Unknown,
    }
}

#[derive(Deserialize, Default)]
struct RespUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl RespUsage {
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
        }
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn required_api_key_name(&self) -> Option<&'static str> {
        Some("ANTHROPIC_API_KEY")
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    async fn chat_step(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
    ) -> Result<StepOutcome, ProviderError> {
        #[derive(Deserialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum RespContent {
            Text {
                text: String,
            },
            ToolUse {
                id: String,
                name: String,
                input: serde_json::Value,
            },
            #[serde(other)]
            Other,
        }
        #[derive(Deserialize)]
        struct Resp {
            content: Vec<RespContent>,
            stop_reason: Option<String>,
            usage: Option<RespUsage>,
        }

        let body = build_body(params, messages, false);
        let resp: Resp = self
            .request(false)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| handle_error(self.name(), "text generation", e))?
            .json()
            .await
            .map_err(|e| handle_error(self.name(), "text generation", e))?;

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        for block in resp.content {
            match block {
                RespContent::Text { text: t } => text.push_str(&t),
                RespContent::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id: Some(id),
                    name,
                    arguments: input,
                }),
                RespContent::Other => {}
            }
        }
        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            map_stop_reason(resp.stop_reason.as_deref())
        };

        Ok(StepOutcome {
            text: (!text.is_empty()).then_some(text),
            tool_calls,
            usage: resp.usage.map(RespUsage::into_usage),
            finish_reason,
        })
    }

    async fn chat_stream(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
    ) -> Result<ChatStream, ProviderError> {
        #[derive(Deserialize)]
        struct TextDelta {
            #[serde(default)]
            text: String,
        }
        #[derive(Deserialize)]
        struct MessageDeltaBody {
            stop_reason: Option<String>,
        }
        #[derive(Deserialize)]
        #[serde(tag = "type")]
        enum Event {
            #[serde(rename = "content_block_delta")]
            ContentBlockDelta { delta: TextDelta },
            #[serde(rename = "message_delta")]
            MessageDelta {
                delta: MessageDeltaBody,
                usage: Option<RespUsage>,
            },
            #[serde(other)]
            Other,
        }

        let body = build_body(params, messages, true);
        let resp = self
            .request(true)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| handle_error(self.name(), "text streaming", e))?;

        let stream = sse_data_lines(resp)
            .map(|line| {
                let data = line.map_err(|e| handle_error("anthropic", "text streaming", e))?;
                let delta = match serde_json::from_str::<Event>(&data) {
                    Ok(Event::ContentBlockDelta { delta }) => ChatDelta {
                        delta: (!delta.text.is_empty()).then_some(delta.text),
                        ..Default::default()
                    },
                    Ok(Event::MessageDelta { delta, usage }) => ChatDelta {
                        finish_reason: Some(map_stop_reason(delta.stop_reason.as_deref())),
                        usage: usage.map(RespUsage::into_usage),
                        ..Default::default()
                    },
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
}
