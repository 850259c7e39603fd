//! 核心编排层：错误与恢复、会话监管、专家工作池、编排器与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod task_scheduler;

pub use builder::{create_llm_from_config, open_knowledge_base, retry_config, PipelineBuilder};
pub use error::{DiagnosisError, RecoveryAction};
pub use orchestrator::{DiagnosisLimits, FaultOrchestrator};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use task_scheduler::TaskScheduler;
