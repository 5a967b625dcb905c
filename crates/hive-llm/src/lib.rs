pub mod providers;
pub mod retry;
pub mod tool_loop;

use std::sync::Arc;

use hive_core::config::ModelConfig;
use hive_core::error::{HiveError, Result};
use hive_core::traits::LlmProvider;

pub use providers::anthropic::AnthropicProvider;
pub use retry::RetryingProvider;
pub use tool_loop::{complete_with_tools, ToolLoopResult, MAX_ITERATIONS_MESSAGE};

/// Create a provider from config, wrapped for retries when configured.
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn LlmProvider>> {
    let base: Arc<dyn LlmProvider> = match config.provider.as_str() {
        "anthropic" | "claude" => Arc::new(AnthropicProvider::new(config.clone())?),
        other => return Err(HiveError::UnsupportedProvider(other.to_string())),
    };
    Ok(match &config.retry {
        Some(retry) => Arc::new(RetryingProvider::new(base, retry.clone())),
        None => base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_provider_anthropic() {
        let config = ModelConfig::default();
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "anthropic");
    }

    #[test]
    fn test_create_provider_unknown() {
        let config = ModelConfig {
            provider: "carrier-pigeon".into(),
            ..Default::default()
        };
        assert!(matches!(
            create_provider(&config),
            Err(HiveError::UnsupportedProvider(_))
        ));
    }
}
