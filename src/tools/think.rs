use super::{Tool, ToolSpec};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};

// Bookkeeping tool for step-by-step reasoning: the model records numbered
// thoughts and gets them echoed back, which keeps chains of reasoning in
// the message history without any side effects.
pub struct SequentialThinking;

#[async_trait]
impl Tool for SequentialThinking {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "sequential_thinking".into(),
            description:
                "Record one step of a numbered thought sequence while working through a problem"
                    .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "thought": { "type": "string" },
                    "thought_number": { "type": "integer", "minimum": 1 },
                    "total_thoughts": { "type": "integer", "minimum": 1 },
                    "next_thought_needed": { "type": "boolean" }
                },
                "required": ["thought", "thought_number", "total_thoughts", "next_thought_needed"],
                "additionalProperties": false
            }),
            read_only: true,
        }
    }

    async fn call(&self, args: &Value) -> Result<Value> {
        let thought = args
            .get("thought")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing 'thought'"))?;
        let number = args.get("thought_number").and_then(|v| v.as_u64()).unwrap_or(1);
        let total = args.get("total_thoughts").and_then(|v| v.as_u64()).unwrap_or(number);
        let more = args
            .get("next_thought_needed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(json!({
            "thought": thought,
            "thought_number": number,
            "total_thoughts": total.max(number),
            "next_thought_needed": more
        }))
    }
}
