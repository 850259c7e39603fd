//! 诊断流水线错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 DiagnosisError 决定 RetryWithPrompt / FeedBack / Degrade / Abort。
//! 除配置错误外，所有错误都在流水线内部被吸收，调用方总能拿到一份 DiagnosisReport。

use thiserror::Error;

use crate::llm::LlmError;

#[derive(Error, Debug)]
pub enum DiagnosisError {
    /// 分类器输出无法解析或故障类型不在分类表内
    #[error("Classification output malformed: {0}")]
    Classification(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool {tool} failed: {reason}")]
    ToolInvocation { tool: String, reason: String },

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Expert {0} timed out")]
    ExpertTimeout(String),

    #[error("Expert {role} failed: {reason}")]
    ExpertFailure { role: String, reason: String },

    #[error("All experts failed")]
    AllExpertsFailed,

    #[error("Config error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Knowledge store error: {0}")]
    Knowledge(String),

    #[error("Cancelled")]
    Cancelled,
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将纠正提示注入下一轮，让 LLM 重新生成（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 作为观察结果反馈给 Agent，循环继续（如工具不存在 / 工具失败）
    FeedBack(String),
    /// 放弃当前步骤，产出降级结果（unknown 分类 / status=error 诊断）
    Degrade,
    /// 终止当前请求
    Abort,
}
