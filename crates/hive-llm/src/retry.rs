use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use hive_core::config::RetryConfig;
use hive_core::error::{HiveError, Result};
use hive_core::traits::LlmProvider;
use hive_core::types::*;

/// A provider that retries failed requests and falls back to alternative providers.
pub struct RetryingProvider {
    primary: Arc<dyn LlmProvider>,
    fallbacks: Vec<Arc<dyn LlmProvider>>,
    retry_config: RetryConfig,
}

impl RetryingProvider {
    pub fn new(primary: Arc<dyn LlmProvider>, retry_config: RetryConfig) -> Self {
        Self {
            primary,
            fallbacks: vec![],
            retry_config,
        }
    }

    pub fn with_fallback(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.fallbacks.push(provider);
        self
    }
}

fn is_retryable(e: &HiveError) -> bool {
    match e {
        HiveError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("529")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = (config.initial_backoff_ms * 2u64.pow(attempt)).min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.complete(request.clone()).await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if is_retryable(&e) && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying LLM request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.fallbacks.is_empty() {
                info!("Primary LLM exhausted, trying fallback providers");
            }
            for fallback in &self.fallbacks {
                match fallback.complete(request.clone()).await {
                    Ok(resp) => {
                        info!(provider = %fallback.name(), "Fell back to alternative provider");
                        return Ok(resp);
                    }
                    Err(e) => {
                        warn!(provider = %fallback.name(), error = %e, "Fallback provider also failed");
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| HiveError::LlmRequest("All providers failed".into())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_test_utils::MockProvider;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&HiveError::LlmRequest("HTTP 429 Too Many Requests".into())));
        assert!(is_retryable(&HiveError::LlmRequest("connection reset".into())));
        assert!(!is_retryable(&HiveError::LlmRequest("HTTP 400 bad request".into())));
        assert!(!is_retryable(&HiveError::Config("no key".into())));
    }

    #[test]
    fn test_backoff_capped() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
        };
        let d = calculate_backoff(8, &cfg);
        assert!(d <= Duration::from_millis(6000));
        assert!(d >= Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mock = Arc::new(
            MockProvider::new()
                .with_error("HTTP 503 overloaded")
                .with_text("recovered"),
        );
        let provider = RetryingProvider::new(mock.clone(), fast_retry(2));
        let resp = provider
            .complete(CompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        assert_eq!(resp.content, "recovered");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_goes_to_fallback() {
        let primary = Arc::new(MockProvider::new().with_error("HTTP 401 unauthorized"));
        let fallback = Arc::new(MockProvider::new().with_text("from fallback"));
        let provider =
            RetryingProvider::new(primary.clone(), fast_retry(3)).with_fallback(fallback);
        let resp = provider
            .complete(CompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap();
        assert_eq!(resp.content, "from fallback");
        assert_eq!(primary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_all_fail_returns_last_error() {
        let primary = Arc::new(MockProvider::new().with_error("HTTP 400 bad"));
        let provider = RetryingProvider::new(primary, fast_retry(1));
        let err = provider
            .complete(CompletionRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("400"));
    }
}
