use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use hive_core::error::{HiveError, Result};
use hive_core::traits::Tool;
use hive_core::types::ToolResult;

const MAX_BODY_CHARS: usize = 10_000;

pub struct HttpRequestTool;

#[derive(Deserialize)]
struct HttpRequestInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

fn default_method() -> String {
    "GET".into()
}

impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn timeout_secs(&self) -> u64 {
        60
    }

    fn description(&self) -> &str {
        "Make an HTTP request. Returns status and body."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string", "description": "HTTP method (default: GET)" },
                "headers": { "type": "object", "description": "Request headers" },
                "body": { "type": "string", "description": "Request body" }
            },
            "required": ["url"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: HttpRequestInput = serde_json::from_value(input)
                .map_err(|e| HiveError::ToolValidation(e.to_string()))?;
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| HiveError::ToolExecution {
                    tool: "http_request".into(),
                    message: e.to_string(),
                })?;

            let method = p
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| HiveError::ToolValidation(format!("Invalid method: {}", e)))?;

            let mut req = client.request(method, &p.url);
            for (k, v) in &p.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(body) = p.body {
                req = req.body(body);
            }

            let resp = req.send().await.map_err(|e| HiveError::ToolExecution {
                tool: "http_request".into(),
                message: e.to_string(),
            })?;
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_BODY_CHARS).collect();

            let payload = serde_json::json!({
                "status": status.as_u16(),
                "body": body,
            })
            .to_string();
            if status.is_success() {
                Ok(ToolResult::success(payload))
            } else {
                Ok(ToolResult::error(payload))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_method_rejected() {
        let err = HttpRequestTool
            .execute(serde_json::json!({"url": "http://localhost", "method": "NOT A METHOD"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn test_url_required() {
        let err = HttpRequestTool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, HiveError::ToolValidation(_)));
    }
}
