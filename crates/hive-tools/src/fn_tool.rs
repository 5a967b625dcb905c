use futures::future::BoxFuture;

use hive_core::error::Result;
use hive_core::traits::Tool;
use hive_core::types::ToolResult;

type ToolFn = dyn Fn(serde_json::Value) -> Result<String> + Send + Sync;

/// A tool backed by a synchronous closure with a static schema.
pub struct FnTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    timeout_secs: u64,
    func: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({ "type": "object", "properties": {} }),
            timeout_secs: 30,
            func: Box::new(func),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move { (self.func)(input).map(ToolResult::success) })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}
