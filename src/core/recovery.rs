//! 错误恢复引擎
//!
//! 根据 DiagnosisError 类型返回 RecoveryAction，供分类器重试、专家工具循环反馈与降级使用。

use crate::core::{DiagnosisError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &DiagnosisError) -> RecoveryAction {
        match err {
            DiagnosisError::Classification(raw) => RecoveryAction::RetryWithPrompt(format!(
                "上一轮输出无法使用: {raw}。\
                你必须只输出一个合法的 JSON 对象，不能输出 Markdown 或其它文字。\
                fault_type 必须取自给定的故障类型列表或 \"unknown\"，confidence 为 0 到 1 之间的数字。\
                例如: {{\"fault_type\": \"datanode_down\", \"confidence\": 0.8, \"related_faults\": [], \"reasoning\": \"...\"}}"
            )),
            DiagnosisError::ToolNotFound(name) => RecoveryAction::FeedBack(format!(
                "tool not found: '{name}' 不存在或不在你的可用工具列表中，请改用列表中的工具，或直接给出诊断。"
            )),
            DiagnosisError::ToolInvocation { tool, reason } => {
                RecoveryAction::FeedBack(format!("工具 {tool} 执行失败: {reason}"))
            }
            DiagnosisError::ToolTimeout(tool) => {
                RecoveryAction::FeedBack(format!("工具 {tool} 执行超时，未返回结果。"))
            }
            DiagnosisError::Llm(_)
            | DiagnosisError::ExpertTimeout(_)
            | DiagnosisError::ExpertFailure { .. }
            | DiagnosisError::AllExpertsFailed
            | DiagnosisError::Knowledge(_) => RecoveryAction::Degrade,
            DiagnosisError::Config(_) | DiagnosisError::Cancelled => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_recovery_classification_error() {
        let engine = RecoveryEngine::new();
        let err = DiagnosisError::Classification("not json".to_string());
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("JSON"));
                assert!(msg.contains("not json"));
            }
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_tool_not_found_is_fed_back() {
        let engine = RecoveryEngine::new();
        let err = DiagnosisError::ToolNotFound("restart_cluster".to_string());
        match engine.handle(&err) {
            RecoveryAction::FeedBack(msg) => {
                assert!(msg.contains("tool not found"));
                assert!(msg.contains("restart_cluster"));
            }
            other => panic!("Expected FeedBack, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_tool_failures_are_fed_back() {
        let engine = RecoveryEngine::new();
        let err = DiagnosisError::ToolInvocation {
            tool: "get_metrics".into(),
            reason: "JMX unreachable".into(),
        };
        assert!(matches!(engine.handle(&err), RecoveryAction::FeedBack(m) if m.contains("JMX unreachable")));
        let err = DiagnosisError::ToolTimeout("get_node_log".into());
        assert!(matches!(engine.handle(&err), RecoveryAction::FeedBack(_)));
    }

    #[test]
    fn test_recovery_llm_error_degrades() {
        let engine = RecoveryEngine::new();
        let err = DiagnosisError::Llm(LlmError::RateLimited { retry_after_ms: 1000 });
        assert_eq!(engine.handle(&err), RecoveryAction::Degrade);
    }

    #[test]
    fn test_recovery_config_aborts() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.handle(&DiagnosisError::Config("bad".into())),
            RecoveryAction::Abort
        );
        assert_eq!(engine.handle(&DiagnosisError::Cancelled), RecoveryAction::Abort);
    }
}
