//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient；RetryingLlmClient 在外层加单次请求超时与指数退避重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::Message;

/// 推理后端错误（区分可重试与不可重试）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error: {0}")]
    Api(String),

    #[error("Empty response")]
    EmptyResponse,
}

impl LlmError {
    /// 网络抖动、超时、限流、空回复可重试；4xx 类 API 错误不重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Api(_))
    }

    /// 按后端返回的错误文本粗分类（async-openai 的错误只保证 Display）
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") {
            LlmError::RateLimited { retry_after_ms: 1000 }
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else if lower.contains("connect")
            || lower.contains("dns")
            || lower.contains("reqwest")
            || lower.contains("connection")
            || lower.contains("502")
            || lower.contains("503")
        {
            LlmError::Network(message.to_string())
        } else {
            LlmError::Api(message.to_string())
        }
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试策略：单次请求超时 + 有界指数退避
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后的等待时间（attempt 从 0 开始）
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// 带重试的客户端包装：可重试错误按退避重试，耗尽后返回最后一次错误
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut attempt = 0u32;
        loop {
            let result =
                match tokio::time::timeout(self.config.request_timeout, self.inner.complete(messages))
                    .await
                {
                    Ok(Ok(text)) if text.trim().is_empty() => Err(LlmError::EmptyResponse),
                    Ok(other) => other,
                    Err(_) => Err(LlmError::Timeout),
                };

            let err = match result {
                Ok(text) => return Ok(text),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.config.max_retries {
                tracing::warn!(attempt, error = %err, "LLM request failed, giving up");
                return Err(err);
            }

            let wait = match &err {
                LlmError::RateLimited { retry_after_ms } => Duration::from_millis(*retry_after_ms)
                    .max(self.config.backoff_for(attempt))
                    .min(self.config.max_backoff),
                _ => self.config.backoff_for(attempt),
            };
            tracing::debug!(attempt, error = %err, wait_ms = wait.as_millis() as u64, "LLM request failed, retrying");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::{MockLlmClient, MockReply};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            request_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::Network("reset".into()).is_retryable());
        assert!(LlmError::RateLimited { retry_after_ms: 10 }.is_retryable());
        assert!(!LlmError::Api("invalid model".into()).is_retryable());
        assert!(matches!(
            LlmError::classify("HTTP 429 Too Many Requests"),
            LlmError::RateLimited { .. }
        ));
        assert!(matches!(LlmError::classify("operation timed out"), LlmError::Timeout));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(1),
        };
        assert_eq!(cfg.backoff_for(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(400));
        assert_eq!(cfg.backoff_for(9), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let mock = Arc::new(
            MockLlmClient::new()
                .push("", MockReply::Fail(LlmError::Network("reset".into())))
                .push("", MockReply::Text("ok".into())),
        );
        let client = RetryingLlmClient::new(mock.clone(), fast_retry(2));
        let out = client.complete(&[Message::user("hi")]).await;
        assert_eq!(out, Ok("ok".to_string()));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_error() {
        let mock = Arc::new(MockLlmClient::new().with_default("", MockReply::Fail(LlmError::Timeout)));
        let client = RetryingLlmClient::new(mock.clone(), fast_retry(2));
        let out = client.complete(&[Message::user("hi")]).await;
        assert_eq!(out, Err(LlmError::Timeout));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_api_error_not_retried() {
        let mock = Arc::new(
            MockLlmClient::new().with_default("", MockReply::Fail(LlmError::Api("bad request".into()))),
        );
        let client = RetryingLlmClient::new(mock.clone(), fast_retry(3));
        assert!(client.complete(&[Message::user("hi")]).await.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_hanging_request_times_out() {
        let mock = Arc::new(MockLlmClient::new().with_default("", MockReply::Hang));
        let client = RetryingLlmClient::new(mock, fast_retry(0));
        assert_eq!(
            client.complete(&[Message::user("hi")]).await,
            Err(LlmError::Timeout)
        );
    }
}
