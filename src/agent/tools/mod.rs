use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::settings::EffectiveSettings;

pub mod calculator;
pub mod search;

pub struct ToolContext<'a> {
    pub thread_id: &'a str,
    pub settings: &'a EffectiveSettings,
    pub http: &'a reqwest::Client,
}

/// Failures a tool reports back to the model as `{"error": ...}`.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Result is out of range")]
    OutOfRange,
    #[error("Unsupported operation '{0}'")]
    UnsupportedOperation(String),
    #[error("Missing argument '{0}'")]
    MissingArgument(&'static str),
    #[error("Argument '{0}' must be a number")]
    NotANumber(&'static str),
    #[error("search provider returned {0}")]
    Provider(reqwest::StatusCode),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the argument object.
    fn parameters(&self) -> Value;
    async fn run(&self, ctx: ToolContext<'_>, args: Value) -> anyhow::Result<Value>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self { Self { tools: Vec::new() } }
    pub fn with_default_tools() -> Self {
        let mut r = Self::new();
        r.register(Box::new(search::SearchTool));
        r.register(Box::new(calculator::CalculatorTool));
        r
    }
    pub fn register(&mut self, t: Box<dyn Tool>) {
        info!(tool = t.name(), "registering tool");
        self.tools.push(t);
    }
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().map(|b| b.as_ref()).find(|t| t.name() == name)
    }

    /// Tool schema in the OpenAI `tools` format.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.parameters(),
                }
            }))
            .collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_exposes_search_and_calculator() {
        let r = ToolRegistry::with_default_tools();
        assert_eq!(r.names(), vec!["search", "calculator"]);
        assert!(r.get("calculator").is_some());
        assert!(r.get("python").is_none());

        let defs = r.definitions();
        assert_eq!(defs.len(), 2);
        let calc = defs.iter().find(|d| d["function"]["name"] == "calculator").unwrap();
        assert_eq!(calc["type"], "function");
        assert_eq!(calc["function"]["parameters"]["required"], json!(["first_num", "second_num", "operation"]));
    }
}
