use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use hive_core::config::ModelConfig;
use hive_core::error::{HiveError, Result};
use hive_core::traits::LlmProvider;
use hive_core::types::*;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    http: Client,
    config: ModelConfig,
}

impl AnthropicProvider {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HiveError::LlmRequest(e.to_string()))?;
        Ok(Self { http, config })
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Serialize, Debug)]
struct ApiMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// Anthropic API response types
#[derive(Deserialize, Debug)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn convert_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<ApiMessage>) {
    let mut system = None;
    let mut api_msgs = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                system = Some(msg.text());
            }
            Role::User => api_msgs.push(ApiMessage {
                role: "user".to_string(),
                content: convert_content_blocks(&msg.content),
            }),
            Role::Assistant => api_msgs.push(ApiMessage {
                role: "assistant".to_string(),
                content: convert_content_blocks(&msg.content),
            }),
        }
    }

    (system, api_msgs)
}

fn convert_content_blocks(blocks: &[ContentBlock]) -> serde_json::Value {
    if blocks.len() == 1 {
        if let ContentBlock::Text { text } = &blocks[0] {
            return serde_json::Value::String(text.clone());
        }
    }

    let api_blocks: Vec<serde_json::Value> = blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => serde_json::json!({
                "type": "text",
                "text": text,
            }),
            ContentBlock::ToolUse { id, name, input } => serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => serde_json::json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
        })
        .collect();

    serde_json::Value::Array(api_blocks)
}

fn parse_stop_reason(s: Option<&str>) -> StopReason {
    match s {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

fn into_response(api: ApiResponse) -> LlmResponse {
    let mut text = String::new();
    let mut tool_uses = Vec::new();
    for block in api.content {
        match block {
            ResponseBlock::Text { text: t } => text.push_str(&t),
            ResponseBlock::ToolUse { id, name, input } => {
                tool_uses.push(ToolUse { id, name, input })
            }
            ResponseBlock::Other => {}
        }
    }
    let (input_tokens, output_tokens) = api
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or((0, 0));

    LlmResponse {
        content: text,
        model: api.model,
        input_tokens,
        output_tokens,
        stop_reason: parse_stop_reason(api.stop_reason.as_deref()),
        tool_uses,
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            let api_key = self
                .config
                .api_key
                .as_deref()
                .ok_or_else(|| HiveError::Config("Anthropic API key not set".into()))?;

            let base_url = self.config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);

            let (inline_system, api_messages) = convert_messages(request.messages);

            let api_tools: Vec<ApiTool> = request
                .tools
                .iter()
                .map(|t| ApiTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect();

            let body = AnthropicRequest {
                model: self.config.model_id.clone(),
                max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
                temperature: if self.config.temperature > 0.0 {
                    Some(self.config.temperature)
                } else {
                    None
                },
                messages: api_messages,
                system: request.system.or(inline_system),
                tools: api_tools,
            };

            let response = self
                .http
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| HiveError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(HiveError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let api: ApiResponse = response
                .json()
                .await
                .map_err(|e| HiveError::LlmParse(e.to_string()))?;
            let parsed = into_response(api);
            debug!(
                input_tokens = parsed.input_tokens,
                output_tokens = parsed.output_tokens,
                tool_uses = parsed.tool_uses.len(),
                "Token usage"
            );
            Ok(parsed)
        })
    }
}
