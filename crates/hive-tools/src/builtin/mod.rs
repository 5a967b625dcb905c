pub mod data;
pub mod fs;
pub mod http;

use crate::registry::ToolRegistryBuilder;

/// Add every built-in tool to a registry under construction.
pub fn register_all(builder: ToolRegistryBuilder) -> ToolRegistryBuilder {
    builder
        .register(fs::ReadFileTool)
        .register(fs::WriteFileTool)
        .register(data::JsonQueryTool)
        .register(http::HttpRequestTool)
}
