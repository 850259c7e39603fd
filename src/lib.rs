//! RCA - Hadoop 集群多智能体故障诊断
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话监管、专家工作池、编排器与构建器
//! - **diagnosis**: 故障分类表、全局上下文、分类器、专家选择、专家 Agent、讨论合成
//! - **knowledge**: 按领域的向量知识库（分词、分块、持久化）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、结构化 Prompt、嵌入
//! - **observability**: tracing 初始化
//! - **tools**: 工具注册表、执行器与内置的日志 / 指标 / 知识检索工具

pub mod config;
pub mod core;
pub mod diagnosis;
pub mod knowledge;
pub mod llm;
pub mod observability;
pub mod tools;

pub use crate::core::{DiagnosisError, FaultOrchestrator, PipelineBuilder};
pub use crate::diagnosis::{DiagnosisReport, GlobalContext};
