use futures::future::BoxFuture;

use hive_core::error::Result;
use hive_core::traits::Tool;
use hive_core::types::{ToolDefinition, ToolResult};

/// Stand-in for a tool that was declared by an agent export but has no
/// executor bound. Returns `{"mock": true, "inputs": ...}`.
pub struct DeclaredTool {
    definition: ToolDefinition,
}

impl DeclaredTool {
    pub fn new(definition: ToolDefinition) -> Self {
        Self { definition }
    }
}

impl Tool for DeclaredTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.definition.input_schema.clone()
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            Ok(ToolResult::success(
                serde_json::json!({ "mock": true, "inputs": input }).to_string(),
            ))
        })
    }
}
