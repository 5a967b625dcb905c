use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use hive_core::error::{HiveError, Result};
use hive_core::traits::Tool;
use hive_core::types::ToolResult;

const MAX_READ_BYTES: usize = 200_000;

pub struct ReadFileTool;

#[derive(Deserialize)]
struct ReadInput {
    path: String,
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file and return its contents."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file" }
            },
            "required": ["path"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: ReadInput = serde_json::from_value(input)
                .map_err(|e| HiveError::ToolValidation(e.to_string()))?;
            debug!(path = %params.path, "Reading file");

            let mut content = tokio::fs::read_to_string(&params.path).await.map_err(|e| {
                HiveError::ToolExecution {
                    tool: "read_file".to_string(),
                    message: format!("{}: {}", params.path, e),
                }
            })?;
            if content.len() > MAX_READ_BYTES {
                let mut end = MAX_READ_BYTES;
                while !content.is_char_boundary(end) {
                    end -= 1;
                }
                content.truncate(end);
            }
            Ok(ToolResult::success(content))
        })
    }
}

pub struct WriteFileTool;

#[derive(Deserialize)]
struct WriteInput {
    path: String,
    content: String,
}

impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file, creating parent directories as needed."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: WriteInput = serde_json::from_value(input)
                .map_err(|e| HiveError::ToolValidation(e.to_string()))?;
            let path = std::path::Path::new(&params.path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, params.content.as_bytes()).await?;
            debug!(path = %params.path, bytes = params.content.len(), "Wrote file");
            Ok(ToolResult::success(
                serde_json::json!({ "path": params.path, "bytes": params.content.len() })
                    .to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");
        let path_str = path.to_string_lossy().to_string();

        let written = WriteFileTool
            .execute(serde_json::json!({"path": path_str, "content": "hello hive"}))
            .await
            .unwrap();
        assert_eq!(written.value()["bytes"], 10);

        let read = ReadFileTool
            .execute(serde_json::json!({"path": path_str}))
            .await
            .unwrap();
        assert_eq!(read.content, "hello hive");
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let err = ReadFileTool
            .execute(serde_json::json!({"path": "/definitely/not/here.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn test_read_requires_path() {
        let err = ReadFileTool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, HiveError::ToolValidation(_)));
    }
}
