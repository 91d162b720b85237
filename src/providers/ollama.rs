use super::{
    AiProvider, ChatDelta, ChatMessage, ChatStream, FinishReason, InvocationParams, ProviderError,
    StepOutcome, Usage, handle_error,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Local inference, credential-less. Speaks Ollama's native /api/chat
// (NDJSON streaming), not the OpenAI-compatible shim.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client, base_url }
    }

    fn url(&self) -> String {
        // accepts both ".../api" and a bare host
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/api") {
            format!("{base}/chat")
        } else {
            format!("{base}/api/chat")
        }
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize, Default)]
struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Serialize)]
struct Body<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    stream: bool,
    options: Options,
}

fn build_body<'a>(
    params: &'a InvocationParams,
    messages: &'a [ChatMessage],
    stream: bool,
) -> Body<'a> {
    Body {
        model: &params.model_id,
        messages: messages
            .iter()
            .filter(|m| m.role != "tool")
            .map(|m| Msg {
                role: &m.role,
                content: &m.content,
            })
            .collect(),
        stream,
        options: Options {
            temperature: params.temperature,
            num_predict: params.max_tokens,
        },
    }
}

#[async_trait]
impl AiProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn required_api_key_name(&self) -> Option<&'static str> {
        None
    }

    async fn chat_step(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
    ) -> Result<StepOutcome, ProviderError> {
        #[derive(Deserialize)]
        struct RespMsg {
            content: String,
        }
        #[derive(Deserialize)]
        struct Resp {
            message: RespMsg,
            #[serde(default)]
            prompt_eval_count: Option<u32>,
            #[serde(default)]
            eval_count: Option<u32>,
        }

        if !params.tools.is_empty() {
            tracing::warn!("ollama adapter does not forward tool specs; ignoring them");
        }

        let body = build_body(params, messages, false);
        let resp: Resp = self
            .client
            .post(self.url())
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| handle_error(self.name(), "text generation", e))?
            .json()
            .await
            .map_err(|e| handle_error(self.name(), "text generation", e))?;

        let usage = match (resp.prompt_eval_count, resp.eval_count) {
            (None, None) => None,
            (input, output) => {
                let input = input.unwrap_or(0);
                let output = output.unwrap_or(0);
                Some(Usage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input + output,
                })
            }
        };

        Ok(StepOutcome {
            text: Some(resp.message.content),
            tool_calls: vec![],
            usage,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn chat_stream(
        &self,
        params: &InvocationParams,
        messages: &[ChatMessage],
    ) -> Result<ChatStream, ProviderError> {
        #[derive(Deserialize)]
        struct ChunkMsg {
            content: String,
        }
        #[derive(Deserialize)]
        struct Chunk {
            done: bool,
            message: Option<ChunkMsg>,
        }

        let body = build_body(params, messages, true);
        let resp = self
            .client
            .post(self.url())
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| handle_error(self.name(), "text streaming", e))?;

        // Ollama streams NDJSON lines
        let stream = resp
            .bytes_stream()
            .map(|chunk_res| {
                let bytes =
                    chunk_res.map_err(|e| handle_error("ollama", "text streaming", e))?;
                let text = String::from_utf8_lossy(&bytes);
                let mut acc = String::new();
                let mut done = false;
                for line in text.split('\n') {
                    let l = line.trim();
                    if l.is_empty() {
                        continue;
                    }
                    if let Ok(chunk) = serde_json::from_str::<Chunk>(l) {
                        if let Some(msg) = chunk.message {
                            acc.push_str(&msg.content);
                        }
                        done |= chunk.done;
                    }
                }
                Ok(ChatDelta {
                    delta: (!acc.is_empty()).then_some(acc),
                    finish_reason: done.then_some(FinishReason::Stop),
                    ..Default::default()
                })
            })
            .filter(|res: &Result<ChatDelta, ProviderError>| {
                let keep = match res {
                    Ok(d) => d.delta.is_some() || d.finish_reason.is_some(),
                    Err(_) => true,
                };
                futures_util::future::ready(keep)
            })
            .boxed();

        Ok(stream)
    }
}
