use super::{
    AiProvider, ChatMessage, ChatStream, FinishReason, GenerateObjectResult, GenerateTextResult,
    InvocationParams, ProviderError, ToolCall, ToolResultRecord, Usage, validate_params,
};
use crate::jsonfix;
use crate::tools::ToolRegistry;

// One logical request may take many vendor round trips when tools are in
// play. The cap bounds runaway loops.
pub const MAX_STEPS: u32 = 50;
// Two independent history guards, checked before every step.
pub const MAX_MESSAGES: usize = 100;
pub const TOKEN_BUDGET: u32 = 20_480;

/// Rough estimate: ~0.25 tokens per character of content.
pub fn estimate_token_count(messages: &[ChatMessage]) -> u32 {
    let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    (chars as f64 * 0.25) as u32
}

/// Keeps every system message plus the most recent non-system messages so
/// the total fits `max_count`. Order within each group is preserved.
pub fn truncate_by_count(messages: Vec<ChatMessage>, max_count: usize) -> Vec<ChatMessage> {
    let (system, other): (Vec<_>, Vec<_>) =
        messages.into_iter().partition(|m| m.role == "system");
    let keep = max_count.saturating_sub(system.len()).max(1);
    let start = other.len().saturating_sub(keep);
    system.into_iter().chain(other.into_iter().skip(start)).collect()
}

/// Keeps every system message and drops the oldest non-system messages
/// until the token estimate fits `budget`. The most recent non-system
/// message is always kept.
pub fn truncate_by_tokens(messages: Vec<ChatMessage>, budget: u32) -> Vec<ChatMessage> {
    let (system, mut other): (Vec<_>, Vec<_>) =
        messages.into_iter().partition(|m| m.role == "system");
    let mut total = estimate_token_count(&system) + estimate_token_count(&other);
    let mut drop = 0;
    while total > budget && drop + 1 < other.len() {
        total = total.saturating_sub(estimate_token_count(std::slice::from_ref(&other[drop])));
        drop += 1;
    }
    other.drain(..drop);
    system.into_iter().chain(other).collect()
}

pub async fn generate_text<P: AiProvider + ?Sized>(
    provider: &P,
    params: &InvocationParams,
    tools: &ToolRegistry,
) -> Result<GenerateTextResult, ProviderError> {
    provider.validate_auth(params)?;
    validate_params(provider.name(), params)?;
    tracing::debug!(
        "generating {} text with model: {}",
        provider.name(),
        params.model_id
    );

    let mut history = params.messages.clone();
    let mut usage = Usage::default();
    let mut all_calls: Vec<ToolCall> = Vec::new();
    let mut all_results: Vec<ToolResultRecord> = Vec::new();
    let mut last_finish = FinishReason::Unknown;

    for step in 0..MAX_STEPS {
        if history.len() > MAX_MESSAGES {
            tracing::debug!("truncating {} messages to {}", history.len(), MAX_MESSAGES);
            history = truncate_by_count(history, MAX_MESSAGES);
        }
        let tokens = estimate_token_count(&history);
        if tokens > TOKEN_BUDGET {
            tracing::debug!("truncating ~{tokens} tokens to ~{TOKEN_BUDGET}");
            history = truncate_by_tokens(history, TOKEN_BUDGET);
        }

        let outcome = provider.chat_step(params, &history).await?;
        usage.add(outcome.usage);
        last_finish = outcome.finish_reason;

        if outcome.tool_calls.is_empty() || outcome.finish_reason == FinishReason::Stop {
            tracing::debug!(
                "{} generateText completed for model: {} after {} step(s)",
                provider.name(),
                params.model_id,
                step + 1
            );
            return Ok(GenerateTextResult {
                text: outcome.text.unwrap_or_default(),
                finish_reason: outcome.finish_reason,
                usage,
                steps: step + 1,
                tool_calls: all_calls,
                tool_results: all_results,
            });
        }

        // Run the requested tools against the pre-call history, then append
        // the assistant turn and its results for the next step.
        let mut executed: Vec<(ToolCall, serde_json::Value)> = Vec::new();
        for call in outcome.tool_calls {
            let (call, output) =
                execute_tool_call(provider, params, tools, &history, call).await?;
            executed.push((call, output));
        }
        history.push(ChatMessage::assistant_tool_calls(
            outcome.text.unwrap_or_default(),
            executed.iter().map(|(c, _)| c.clone()).collect(),
        ));
        for (call, output) in executed {
            history.push(ChatMessage::tool_result(&call, output.to_string()));
            all_results.push(ToolResultRecord {
                name: call.name.clone(),
                tool_call_id: call.id.clone(),
                output,
            });
            all_calls.push(call);
        }
    }

    Err(ProviderError::StepLimitExceeded {
        limit: MAX_STEPS,
        finish_reason: last_finish,
    })
}

// Unknown tools propagate immediately; any other tool failure gets exactly
// one corrective call before the original error surfaces.
async fn execute_tool_call<P: AiProvider + ?Sized>(
    provider: &P,
    params: &InvocationParams,
    tools: &ToolRegistry,
    history: &[ChatMessage],
    call: ToolCall,
) -> Result<(ToolCall, serde_json::Value), ProviderError> {
    let Some(tool) = tools.get(&call.name) else {
        return Err(ProviderError::UnknownTool(call.name));
    };
    match tool.call(&call.arguments).await {
        Ok(output) => Ok((call, output)),
        Err(err) => {
            let original = ProviderError::ToolFailed {
                name: call.name.clone(),
                message: err.to_string(),
            };
            tracing::warn!(
                "tool '{}' failed ({err}), asking the model to correct its arguments",
                call.name
            );
            match repair_tool_call(provider, params, history, &call, &err.to_string()).await {
                Some(arguments) => {
                    let repaired = ToolCall { arguments, ..call };
                    match tool.call(&repaired.arguments).await {
                        Ok(output) => Ok((repaired, output)),
                        Err(_) => Err(original),
                    }
                }
                None => Err(original),
            }
        }
    }
}

// Replays the failing assistant tool-call plus the error as a synthetic
// tool result and lets the model retry. Only a retry naming the same tool
// counts; anything else abandons the repair.
async fn repair_tool_call<P: AiProvider + ?Sized>(
    provider: &P,
    params: &InvocationParams,
    history: &[ChatMessage],
    call: &ToolCall,
    error_message: &str,
) -> Option<serde_json::Value> {
    let mut messages = history.to_vec();
    messages.push(ChatMessage::assistant_tool_calls(
        String::new(),
        vec![call.clone()],
    ));
    messages.push(ChatMessage::tool_result(call, error_message));
    let outcome = provider.chat_step(params, &messages).await.ok()?;
    outcome
        .tool_calls
        .into_iter()
        .find(|c| c.name == call.name)
        .map(|c| c.arguments)
}

pub async fn stream_text<P: AiProvider + ?Sized>(
    provider: &P,
    params: &InvocationParams,
) -> Result<ChatStream, ProviderError> {
    provider.validate_auth(params)?;
    validate_params(provider.name(), params)?;
    tracing::debug!(
        "streaming {} text with model: {}",
        provider.name(),
        params.model_id
    );
    provider.chat_stream(params, &params.messages).await
}

pub async fn generate_object<P: AiProvider + ?Sized>(
    provider: &P,
    params: &InvocationParams,
) -> Result<GenerateObjectResult, ProviderError> {
    provider.validate_auth(params)?;
    validate_params(provider.name(), params)?;
    let Some(schema) = &params.schema else {
        return Err(ProviderError::InvalidRequest(
            "schema is required for object generation".into(),
        ));
    };
    let Some(object_name) = &params.object_name else {
        return Err(ProviderError::InvalidRequest(
            "object name is required for object generation".into(),
        ));
    };
    tracing::debug!(
        "generating {} object ('{object_name}') with model: {}",
        provider.name(),
        params.model_id
    );

    let mut messages = params.messages.clone();
    messages.push(ChatMessage::system(format!(
        "Respond with a single JSON value for '{object_name}' matching this schema, and nothing else:\n{schema}"
    )));

    let outcome = provider.chat_step(params, &messages).await?;
    let raw = outcome.text.unwrap_or_default();
    let usage = outcome.usage.unwrap_or_default();

    match serde_json::from_str::<serde_json::Value>(raw.trim()) {
        Ok(object) => Ok(GenerateObjectResult {
            object,
            usage,
            repaired: false,
        }),
        Err(parse_err) => {
            tracing::warn!(
                "{} generated malformed JSON, attempting to repair",
                provider.name()
            );
            let fixed = jsonfix::repair(&raw);
            match serde_json::from_str::<serde_json::Value>(&fixed) {
                Ok(object) => {
                    tracing::info!("successfully repaired {} JSON output", provider.name());
                    // Usage stays best-effort: zeros where the vendor gave none.
                    Ok(GenerateObjectResult {
                        object,
                        usage,
                        repaired: true,
                    })
                }
                Err(repair_err) => {
                    tracing::error!(
                        "failed to repair {} JSON: {repair_err}",
                        provider.name()
                    );
                    Err(ProviderError::MalformedOutput {
                        message: parse_err.to_string(),
                        raw,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StepOutcome;
    use crate::tools::{Tool, ToolSpec};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn msg_n(n: usize) -> ChatMessage {
        ChatMessage::user(format!("message {n}"))
    }

    #[test]
    fn count_truncation_keeps_system_plus_most_recent() {
        let mut messages = vec![
            ChatMessage::system("s1"),
            ChatMessage::system("s2"),
            ChatMessage::system("s3"),
        ];
        messages.extend((0..150).map(msg_n));

        let out = truncate_by_count(messages, MAX_MESSAGES);
        assert_eq!(out.len(), MAX_MESSAGES);
        assert!(out[..3].iter().all(|m| m.role == "system"));
        // 100 - 3 system = 97 most recent, in original order
        assert_eq!(out[3].content, "message 53");
        assert_eq!(out.last().unwrap().content, "message 149");
    }

    #[test]
    fn count_truncation_without_system_keeps_exactly_the_cap() {
        let messages: Vec<_> = (0..150).map(msg_n).collect();
        let out = truncate_by_count(messages, 100);
        assert_eq!(out.len(), 100);
        assert_eq!(out[0].content, "message 50");
    }

    #[test]
    fn token_estimate_is_quarter_of_chars() {
        let messages = vec![ChatMessage::user("a".repeat(400))];
        assert_eq!(estimate_token_count(&messages), 100);
    }

    #[test]
    fn token_truncation_drops_oldest_until_within_budget() {
        let mut messages = vec![ChatMessage::system("pinned")];
        // 10 messages x 400 chars = ~1000 tokens
        messages.extend((0..10).map(|i| ChatMessage::user(format!("{i:<400}"))));
        let out = truncate_by_tokens(messages, 500);
        assert_eq!(out[0].content, "pinned");
        assert!(estimate_token_count(&out) <= 500);
        // newest survives
        assert!(out.last().unwrap().content.starts_with('9'));
    }

    struct Scripted {
        steps: Mutex<Vec<StepOutcome>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(steps: Vec<StepOutcome>) -> Self {
            let mut steps = steps;
            steps.reverse();
            Self {
                steps: Mutex::new(steps),
                calls: AtomicU32::new(0),
            }
        }
        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AiProvider for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn required_api_key_name(&self) -> Option<&'static str> {
            None
        }
        async fn chat_step(
            &self,
            _params: &InvocationParams,
            _messages: &[ChatMessage],
        ) -> Result<StepOutcome, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .steps
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| StepOutcome {
                    text: Some("exhausted".into()),
                    finish_reason: FinishReason::Stop,
                    ..Default::default()
                }))
        }
        async fn chat_stream(
            &self,
            _params: &InvocationParams,
            _messages: &[ChatMessage],
        ) -> Result<ChatStream, ProviderError> {
            unimplemented!("not exercised in these tests")
        }
    }

    struct Flaky;

    #[async_trait]
    impl Tool for Flaky {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "flaky".into(),
                description: "fails unless args contain fixed=true".into(),
                parameters: json!({"type": "object"}),
                read_only: true,
            }
        }
        async fn call(&self, args: &Value) -> anyhow::Result<Value> {
            if args.get("fixed").and_then(Value::as_bool).unwrap_or(false) {
                Ok(json!({"ok": true}))
            } else {
                Err(anyhow!("bad arguments"))
            }
        }
    }

    fn registry_with_flaky() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Box::new(Flaky));
        reg
    }

    fn params() -> InvocationParams {
        InvocationParams {
            model_id: "test-model".into(),
            messages: vec![ChatMessage::user("do the thing")],
            ..Default::default()
        }
    }

    fn tool_step(name: &str, args: Value) -> StepOutcome {
        StepOutcome {
            text: None,
            tool_calls: vec![ToolCall {
                id: Some("call_1".into()),
                name: name.into(),
                arguments: args,
            }],
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
            finish_reason: FinishReason::ToolCalls,
        }
    }

    fn stop_step(text: &str) -> StepOutcome {
        StepOutcome {
            text: Some(text.into()),
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
            finish_reason: FinishReason::Stop,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn single_step_returns_text_and_usage() {
        let provider = Scripted::new(vec![stop_step("done")]);
        let out = generate_text(&provider, &params(), &ToolRegistry::new())
            .await
            .unwrap();
        assert_eq!(out.text, "done");
        assert_eq!(out.steps, 1);
        assert_eq!(out.usage.total_tokens, 15);
        assert_eq!(out.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn tool_loop_executes_and_accumulates_usage() {
        let provider = Scripted::new(vec![
            tool_step("flaky", json!({"fixed": true})),
            stop_step("final answer"),
        ]);
        let out = generate_text(&provider, &params(), &registry_with_flaky())
            .await
            .unwrap();
        assert_eq!(out.text, "final answer");
        assert_eq!(out.steps, 2);
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_results.len(), 1);
        assert_eq!(out.tool_results[0].output, json!({"ok": true}));
        assert_eq!(out.usage.total_tokens, 30);
    }

    #[tokio::test]
    async fn unknown_tool_propagates_without_repair() {
        let provider = Scripted::new(vec![tool_step("no_such_tool", json!({}))]);
        let err = generate_text(&provider, &params(), &registry_with_flaky())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownTool(ref name) if name == "no_such_tool"));
        // no corrective call was issued
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn failing_tool_gets_exactly_one_repair_attempt() {
        let provider = Scripted::new(vec![
            tool_step("flaky", json!({"fixed": false})),
            // the corrective call answers with corrected arguments
            tool_step("flaky", json!({"fixed": true})),
            stop_step("after repair"),
        ]);
        let out = generate_text(&provider, &params(), &registry_with_flaky())
            .await
            .unwrap();
        assert_eq!(out.text, "after repair");
        // repaired arguments replaced the original call
        assert_eq!(out.tool_calls[0].arguments, json!({"fixed": true}));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn repair_naming_a_different_tool_is_abandoned() {
        let provider = Scripted::new(vec![
            tool_step("flaky", json!({"fixed": false})),
            tool_step("some_other_tool", json!({})),
        ]);
        let err = generate_text(&provider, &params(), &registry_with_flaky())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ToolFailed { ref name, .. } if name == "flaky"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn step_cap_without_stop_is_an_error() {
        let steps: Vec<_> = (0..MAX_STEPS)
            .map(|_| tool_step("flaky", json!({"fixed": true})))
            .collect();
        let provider = Scripted::new(steps);
        let err = generate_text(&provider, &params(), &registry_with_flaky())
            .await
            .unwrap_err();
        match err {
            ProviderError::StepLimitExceeded {
                limit,
                finish_reason,
            } => {
                assert_eq!(limit, MAX_STEPS);
                assert_eq!(finish_reason, FinishReason::ToolCalls);
            }
            other => panic!("expected StepLimitExceeded, got {other:?}"),
        }
        assert_eq!(provider.call_count(), MAX_STEPS);
    }

    fn object_params() -> InvocationParams {
        InvocationParams {
            schema: Some(json!({"type": "object"})),
            object_name: Some("thing".into()),
            ..params()
        }
    }

    #[tokio::test]
    async fn object_generation_repairs_trailing_comma() {
        let provider = Scripted::new(vec![StepOutcome {
            text: Some(r#"{"a": 1,}"#.into()),
            finish_reason: FinishReason::Stop,
            ..Default::default()
        }]);
        let out = generate_object(&provider, &object_params()).await.unwrap();
        assert_eq!(out.object, json!({"a": 1}));
        assert!(out.repaired);
        // vendor supplied no usage: zeros
        assert_eq!(out.usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn object_generation_clean_json_is_not_marked_repaired() {
        let provider = Scripted::new(vec![stop_step(r#"{"b": 2}"#)]);
        let out = generate_object(&provider, &object_params()).await.unwrap();
        assert_eq!(out.object, json!({"b": 2}));
        assert!(!out.repaired);
        assert_eq!(out.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn unrepairable_output_propagates_the_original_error() {
        let provider = Scripted::new(vec![stop_step("no json here at all")]);
        let err = generate_object(&provider, &object_params())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MalformedOutput { .. }));
    }

    #[tokio::test]
    async fn object_generation_requires_schema_and_name() {
        let provider = Scripted::new(vec![]);
        let mut p = params();
        p.schema = None;
        assert!(generate_object(&provider, &p).await.is_err());
        p.schema = Some(json!({}));
        p.object_name = None;
        assert!(generate_object(&provider, &p).await.is_err());
    }
}
