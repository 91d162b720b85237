use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub read_only: bool,
}

// Tool execution is awaited between engine steps; there is no parallel
// dispatch within a step.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn call(&self, args: &Value) -> Result<Value>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: vec![] }
    }

    pub fn with_default() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(read_file::ReadFile));
        reg.register(Box::new(write_file::WriteFile));
        reg.register(Box::new(run_command::RunCommand));
        reg.register(Box::new(think::SequentialThinking));
        reg
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }

    pub fn list_filtered(&self, allow: Option<&[String]>, read_only_only: bool) -> Vec<ToolSpec> {
        let allow_set: Option<std::collections::HashSet<&str>> =
            allow.map(|v| v.iter().map(|s| s.as_str()).collect());
        self.tools
            .iter()
            .map(|t| t.spec())
            .filter(|spec| match &allow_set {
                Some(set) => set.contains(spec.name.as_str()),
                None => true,
            })
            .filter(|spec| if read_only_only { spec.read_only } else { true })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub mod read_file;
pub mod run_command;
pub mod think;
pub mod write_file;
