use futures::future::BoxFuture;
use serde::Deserialize;

use hive_core::error::{HiveError, Result};
use hive_core::traits::Tool;
use hive_core::types::ToolResult;

pub struct JsonQueryTool;

#[derive(Deserialize)]
struct JsonQueryInput {
    json: serde_json::Value,
    path: String,
}

impl Tool for JsonQueryTool {
    fn name(&self) -> &str {
        "json_query"
    }

    fn description(&self) -> &str {
        "Query a JSON value by dot-notation path (e.g. 'items[0].name')."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json": { "description": "JSON value, or a string containing JSON" },
                "path": { "type": "string", "description": "Dot-notation path (e.g. 'items[0].name')" }
            },
            "required": ["json", "path"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: JsonQueryInput = serde_json::from_value(input)
                .map_err(|e| HiveError::ToolValidation(e.to_string()))?;
            let value = match p.json {
                serde_json::Value::String(s) => serde_json::from_str(&s)
                    .map_err(|e| HiveError::ToolValidation(format!("Invalid JSON: {}", e)))?,
                other => other,
            };
            let result = json_path_query(&value, &p.path);
            Ok(ToolResult::success(serde_json::to_string(&result)?))
        })
    }
}

fn json_path_query(value: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = match current.get(key) {
                Some(v) => v,
                None => return serde_json::Value::Null,
            };
        }
        for idx in indexes
            .split(|c| c == '[' || c == ']')
            .filter(|s| !s.is_empty())
        {
            current = match idx.parse::<usize>().ok().and_then(|i| current.get(i)) {
                Some(v) => v,
                None => return serde_json::Value::Null,
            };
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_path_query() {
        let v = serde_json::json!({"items": [{"name": "a"}, {"name": "b", "tags": [[1, 2]]}]});
        assert_eq!(json_path_query(&v, "items[1].name"), "b");
        assert_eq!(json_path_query(&v, "items[1].tags[0][1]"), 2);
        assert_eq!(json_path_query(&v, "items[5].name"), serde_json::Value::Null);
        assert_eq!(json_path_query(&v, "missing.deep"), serde_json::Value::Null);
        assert_eq!(json_path_query(&v, ""), v);
    }

    #[tokio::test]
    async fn test_query_accepts_string_json() {
        let result = JsonQueryTool
            .execute(serde_json::json!({"json": "{\"a\": {\"b\": 7}}", "path": "a.b"}))
            .await
            .unwrap();
        assert_eq!(result.content, "7");
    }

    #[tokio::test]
    async fn test_query_rejects_bad_json_string() {
        let err = JsonQueryTool
            .execute(serde_json::json!({"json": "{oops", "path": "a"}))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::ToolValidation(_)));
    }
}
