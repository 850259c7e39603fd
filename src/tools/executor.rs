//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时；execute 把失败映射为 DiagnosisError，
//! invoke 再经 RecoveryEngine 转成 Agent 可读的观察文本（工具不存在 / 失败 / 超时都不会中断专家循环）。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::timeout;

use crate::core::{DiagnosisError, RecoveryAction, RecoveryEngine};
use crate::diagnosis::ToolOutcome;
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct ToolObservation {
    pub tool: String,
    pub outcome: ToolOutcome,
    pub output: String,
    pub duration_ms: u64,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    recovery: RecoveryEngine,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行指定工具：不在白名单或未注册为 ToolNotFound，超时为 ToolTimeout，工具返回 Err 为 ToolInvocation
    pub async fn execute(
        &self,
        tool_name: &str,
        args: &str,
        allowed: &[String],
    ) -> Result<String, DiagnosisError> {
        let start = Instant::now();
        let tool = self
            .registry
            .get(tool_name)
            .filter(|_| allowed.iter().any(|a| a == tool_name));

        let result = match tool {
            None => Err(DiagnosisError::ToolNotFound(tool_name.to_string())),
            Some(tool) => match timeout(self.timeout, tool.invoke(args)).await {
                Ok(Ok(content)) => Ok(content),
                Ok(Err(reason)) => Err(DiagnosisError::ToolInvocation {
                    tool: tool_name.to_string(),
                    reason,
                }),
                Err(_) => Err(DiagnosisError::ToolTimeout(tool_name.to_string())),
            },
        };

        let outcome = outcome_of(&result);
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview(args, 200),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }

    /// 执行并转为观察结果；失败经恢复引擎转成反馈文本
    pub async fn invoke(&self, tool_name: &str, args: &str, allowed: &[String]) -> ToolObservation {
        let start = Instant::now();
        let result = self.execute(tool_name, args, allowed).await;
        let outcome = outcome_of(&result);
        let output = match result {
            Ok(content) => content,
            Err(err) => match self.recovery.handle(&err) {
                RecoveryAction::FeedBack(msg) | RecoveryAction::RetryWithPrompt(msg) => msg,
                RecoveryAction::Degrade | RecoveryAction::Abort => err.to_string(),
            },
        };
        ToolObservation {
            tool: tool_name.to_string(),
            outcome,
            output,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn outcome_of(result: &Result<String, DiagnosisError>) -> ToolOutcome {
    match result {
        Ok(_) => ToolOutcome::Ok,
        Err(DiagnosisError::ToolNotFound(_)) => ToolOutcome::NotFound,
        Err(DiagnosisError::ToolTimeout(_)) => ToolOutcome::Timeout,
        Err(_) => ToolOutcome::Error,
    }
}

pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;

    async fn executor(timeout_ms: u64) -> ToolExecutor {
        let mut registry = ToolRegistry::new(Arc::new(HashingEmbedder::default()));
        registry
            .register_fn("get_metrics", "fetch metrics", |_| async {
                Ok::<_, String>("0 live units, 0 dead units, JMX unreachable".to_string())
            })
            .await;
        registry
            .register_fn("broken", "always fails", |_| async {
                Err::<String, _>("connection refused".to_string())
            })
            .await;
        registry
            .register_fn("stuck", "never returns", |_| async {
                std::future::pending::<Result<String, String>>().await
            })
            .await;
        ToolExecutor::new(Arc::new(registry), Duration::from_millis(timeout_ms))
    }

    fn all() -> Vec<String> {
        vec!["get_metrics".into(), "broken".into(), "stuck".into()]
    }

    #[tokio::test]
    async fn test_invoke_ok() {
        let ex = executor(500).await;
        let obs = ex.invoke("get_metrics", "{}", &all()).await;
        assert_eq!(obs.outcome, ToolOutcome::Ok);
        assert!(obs.output.contains("JMX unreachable"));
    }

    #[tokio::test]
    async fn test_unknown_or_disallowed_tool_is_not_found_observation() {
        let ex = executor(500).await;
        let obs = ex.invoke("format_namenode", "{}", &all()).await;
        assert_eq!(obs.outcome, ToolOutcome::NotFound);
        assert!(obs.output.contains("tool not found"));

        let obs = ex.invoke("get_metrics", "{}", &["broken".to_string()]).await;
        assert_eq!(obs.outcome, ToolOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_failure_becomes_text() {
        let ex = executor(500).await;
        let obs = ex.invoke("broken", "{}", &all()).await;
        assert_eq!(obs.outcome, ToolOutcome::Error);
        assert!(obs.output.contains("connection refused"));
        assert!(matches!(
            ex.execute("broken", "{}", &all()).await,
            Err(DiagnosisError::ToolInvocation { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_becomes_text() {
        let ex = executor(30).await;
        let obs = ex.invoke("stuck", "{}", &all()).await;
        assert_eq!(obs.outcome, ToolOutcome::Timeout);
        assert!(obs.output.contains("超时"));
    }
}
