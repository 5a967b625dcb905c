use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use hive_core::error::{HiveError, Result};
use hive_core::traits::{Tool, ToolExecutor};
use hive_core::types::{ToolDefinition, ToolResult, ToolUse};

use crate::mock::DeclaredTool;

/// Registry of available tools. Built once, read-only afterwards.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

/// Collects tools before the registry is frozen.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    /// Register a tool. A later registration with the same name replaces the earlier one.
    pub fn register(mut self, tool: impl Tool) -> Self {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
        self
    }

    pub fn register_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    /// Declare a tool by definition only. Unless a real tool with the same
    /// name is registered, calls return a mock payload echoing the inputs.
    pub fn declare(mut self, definition: ToolDefinition) -> Self {
        if !self.tools.contains_key(&definition.name) {
            let tool = DeclaredTool::new(definition);
            self.tools.insert(tool.name().to_string(), Arc::new(tool));
        }
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// An empty registry: every call is an unknown-tool error.
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// Registry with the built-in tools.
    pub fn with_builtins() -> Self {
        crate::builtin::register_all(Self::builder()).build()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name, failing on unknown tools and timeouts.
    pub async fn call(&self, name: &str, input: serde_json::Value) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| HiveError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(HiveError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }
}

impl ToolExecutor for ToolRegistry {
    fn execute(&self, call: ToolUse) -> BoxFuture<'_, ToolResult> {
        Box::pin(async move {
            if !self.contains(&call.name) {
                warn!(tool = %call.name, "Unknown tool requested");
                return ToolResult::error_json(format!("Unknown tool: {}", call.name));
            }
            debug!(tool = %call.name, id = %call.id, "Executing tool");
            match AssertUnwindSafe(self.call(&call.name, call.input))
                .catch_unwind()
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => ToolResult::error_json(e.to_string()),
                Err(_) => {
                    warn!(tool = %call.name, "Tool panicked");
                    ToolResult::error_json(format!("Tool panicked: {}", call.name))
                }
            }
        })
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FnTool;

    fn call(name: &str, input: serde_json::Value) -> ToolUse {
        ToolUse {
            id: "tu_1".into(),
            name: name.into(),
            input,
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .register(FnTool::new("add", "Add two numbers", |input| {
                let a = input["a"].as_i64().unwrap_or(0);
                let b = input["b"].as_i64().unwrap_or(0);
                Ok(serde_json::json!({ "sum": a + b }).to_string())
            }))
            .register(FnTool::new("fail", "Always fails", |_| {
                Err(HiveError::ToolExecution {
                    tool: "fail".into(),
                    message: "disk full".into(),
                })
            }))
            .register(FnTool::new("explode", "Panics", |_| panic!("kaboom")))
            .build()
    }

    #[tokio::test]
    async fn test_execute_known_tool() {
        let r = registry();
        let result = r.execute(call("add", serde_json::json!({"a": 2, "b": 3}))).await;
        assert!(!result.is_error);
        assert_eq!(result.value()["sum"], 5);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_structured_error() {
        let r = registry();
        let result = r.execute(call("nope", serde_json::json!({}))).await;
        assert!(result.is_error);
        assert_eq!(result.value()["error"], "Unknown tool: nope");
    }

    #[tokio::test]
    async fn test_tool_error_becomes_result() {
        let r = registry();
        let result = r.execute(call("fail", serde_json::json!({}))).await;
        assert!(result.is_error);
        assert!(result.value()["error"].as_str().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_tool_panic_contained() {
        let r = registry();
        let result = r.execute(call("explode", serde_json::json!({}))).await;
        assert!(result.is_error);
        assert!(result.content.contains("panicked"));
    }

    #[tokio::test]
    async fn test_declared_tool_is_mocked() {
        let r = ToolRegistry::builder()
            .declare(ToolDefinition {
                name: "send_email".into(),
                description: "Send an email".into(),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .build();
        let result = r.execute(call("send_email", serde_json::json!({"to": "a@b.c"}))).await;
        assert!(!result.is_error);
        let v = result.value();
        assert_eq!(v["mock"], true);
        assert_eq!(v["inputs"]["to"], "a@b.c");
    }

    #[test]
    fn test_declare_does_not_shadow_real_tool() {
        let r = ToolRegistry::builder()
            .register(FnTool::new("lookup", "real", |_| Ok("real".into())))
            .declare(ToolDefinition {
                name: "lookup".into(),
                description: "declared".into(),
                input_schema: serde_json::json!({}),
            })
            .build();
        assert_eq!(r.get("lookup").unwrap().description(), "real");
    }

    #[test]
    fn test_definitions_sorted() {
        let r = registry();
        let names: Vec<String> = r.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["add", "explode", "fail"]);
        assert_eq!(r.list(), vec!["add", "explode", "fail"]);
        assert_eq!(r.len(), 3);
        assert!(ToolRegistry::empty().is_empty());
    }
}
