use super::{
    AiProvider, ChatDelta, ChatMessage, ChatStream, FinishReason, InvocationParams, ProviderError,
    ProviderKind, StepOutcome, ToolCall, Usage, active_tool_specs, handle_error, sse_data_lines,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chat-completions adapter shared by every OpenAI-compatible vendor
/// (openai, perplexity, xai, openrouter, mistral, azure, bedrock gateways);
/// only the base URL and key differ per kind.
pub struct OpenAiCompatProvider {
    name: &'static str,
    key_env: Option<&'static str>,
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn new(kind: ProviderKind, base_url: String, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            name: kind.as_str(),
            key_env: kind.api_key_env(),
            client,
            base_url,
            api_key,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request(&self, stream: bool) -> reqwest::RequestBuilder {
        let mut req = self.client.post(self.url());
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if !stream {
            req = req.timeout(REQUEST_TIMEOUT);
        }
        req
    }
}

#[derive(Serialize)]
struct OutMsg<'a> {
    role: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OutToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
struct OutToolCall {
    id: String,
    r#type: &'static str,
    function: OutFunction,
}

#[derive(Serialize)]
struct OutFunction {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct ToolWrapper<'a> {
    r#type: &'a str,
    function: FunctionDef<'a>,
}

#[derive(Serialize)]
struct FunctionDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize)]
struct Body<'a> {
    model: &'a str,
    messages: Vec<OutMsg<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolWrapper<'a>>>,
}

fn build_messages(messages: &[ChatMessage]) -> Vec<OutMsg<'_>> {
    messages
        .iter()
        .map(|m| match m.role.as_str() {
            "tool" => OutMsg {
                role: "tool",
                content: Some(&m.content),
                tool_calls: None,
                tool_call_id: m.tool_call_id.as_deref(),
                name: m.name.as_deref(),
            },
            "assistant" => OutMsg {
                role: "assistant",
                content: (!m.content.is_empty()).then_some(m.content.as_str()),
                tool_calls: m.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|c| OutToolCall {
                            id: c.id.clone().unwrap_or_else(|| "call_0".into()),
                            r#type: "function",
                            function: OutFunction {
                                name: c.name.clone(),
                                arguments: c.arguments.to_string(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: None,
                name: None,
            },
            role => OutMsg {
                role,
                content: Some(&m.content),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
        })
        .collect()
}

fn build_tools(params: &InvocationParams) -> Option<Vec<ToolWrapper<'_>>> {
    let specs = active_tool_specs(params);
    if specs.is_empty() {
        return None;
    }
    Some(
        specs
            .into_iter()
            .map(|t| ToolWrapper {
                r#type: "function",
                function: FunctionDef {
                    name: &t.name,
                    description: &t.description,
                    parameters: &t.parameters,
                },
            })
            .collect(),
    )
}

fn map_finish(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        _ => FinishReason::Unknown,
    }
}

#[derive(Deserialize)]
struct RespUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl RespUsage {
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

#[async_trait]
impl AiProvider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn required_api_key_name(&self) -> Option<&'static str> {
        self.key_env
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
        struct ChoiceToolCall {
            id: Option<String>,
            function: ChoiceFunction,
        }
        #[derive(Deserialize)]
        struct ChoiceFunction {
            name: String,
            arguments: String,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
            #[serde(default)]
            tool_calls: Vec<ChoiceToolCall>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
            finish_reason: Option<String>,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
            usage: Option<RespUsage>,
        }

        let body = Body {
            model: &params.model_id,
            messages: build_messages(messages),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream: false,
            tools: build_tools(params),
        };

        let resp: Resp = self
            .request(false)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| handle_error(self.name, "text generation", e))?
            .json()
            .await
            .map_err(|e| handle_error(self.name, "text generation", e))?;

        let usage = resp.usage.map(RespUsage::into_usage);
        let Some(choice) = resp.choices.into_iter().next() else {
            return Err(handle_error(
                self.name,
                "text generation",
                "response contained no choices",
            ));
        };
        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect();
        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            map_finish(choice.finish_reason.as_deref())
        };

        Ok(StepOutcome {
            text: choice.message.content,
            tool_calls,
            usage,
            finish_reason,
        })
    }

    async fn chat_stream(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
    ) -> Result<ChatStream, ProviderError> {
        #[derive(Deserialize)]
        struct ToolDelta {
            #[allow(dead_code)]
            index: Option<usize>,
        }
        #[derive(Deserialize)]
        struct DeltaMsg {
            content: Option<String>,
            #[serde(default)]
            tool_calls: Vec<ToolDelta>,
        }
        #[derive(Deserialize)]
        struct Choice {
            delta: DeltaMsg,
            #[serde(default)]
            finish_reason: Option<String>,
        }
        #[derive(Deserialize)]
        struct Chunk {
            choices: Vec<Choice>,
            usage: Option<RespUsage>,
        }

        let body = Body {
            model: &params.model_id,
            messages: build_messages(messages),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream: true,
            tools: build_tools(params),
        };

        let name = self.name;
        let resp = self
            .request(true)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| handle_error(name, "text streaming", e))?;

        let stream = sse_data_lines(resp)
            .map(move |line| {
                let data = line.map_err(|e| handle_error(name, "text streaming", e))?;
                let chunk: Chunk = serde_json::from_str(&data)
                    .map_err(|e| handle_error(name, "text streaming", e))?;
                let mut delta = ChatDelta {
                    usage: chunk.usage.map(RespUsage::into_usage),
                    ..Default::default()
                };
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        delta.delta = Some(match delta.delta.take() {
                            Some(mut acc) => {
                                acc.push_str(&content);
                                acc
                            }
                            None => content,
                        });
                    }
                    if !choice.delta.tool_calls.is_empty() {
                        delta.tool_calls = Some(vec![]);
                    }
                    if let Some(reason) = choice.finish_reason.as_deref() {
                        delta.finish_reason = Some(map_finish(Some(reason)));
                        if reason == "tool_calls" {
                            delta.tool_calls = Some(vec![]);
                        }
                    }
                }
                Ok(delta)
            })
            .filter(|res: &Result<ChatDelta, ProviderError>| {
                let keep = match res {
                    Ok(d) => {
                        d.delta.is_some()
                            || d.tool_calls.is_some()
                            || d.usage.is_some()
                            || d.finish_reason.is_some()
                    }
                    Err(_) => true,
                };
                futures_util::future::ready(keep)
            })
            .boxed();

        Ok(stream)
    }
}
