//! 诊断工具：注册表、执行器、输出格式 Schema 与内置的日志 / 指标 / 知识检索工具

pub mod executor;
pub mod knowledge_search;
pub mod logs;
pub mod metrics;
pub mod registry;
pub mod schema;

use std::sync::Arc;

use crate::config::ToolsSection;
use crate::knowledge::KnowledgeBase;

pub use executor::{ToolExecutor, ToolObservation};
pub use knowledge_search::KnowledgeSearchTool;
pub use logs::{DirLogSource, ErrorSummaryTool, LogSource, NodeLogTool, SearchLogsTool, StaticLogSource};
pub use metrics::{JmxMetricSource, MetricSource, MetricsTool, StaticMetricSource};
pub use registry::{FnTool, Tool, ToolArgs, ToolMatch, ToolRegistry};
pub use schema::{classification_schema_json, final_diagnosis_schema_json, tool_call_schema_json};

pub const TOOL_NODE_LOG: &str = "get_node_log";
pub const TOOL_SEARCH_LOGS: &str = "search_logs";
pub const TOOL_ERROR_SUMMARY: &str = "get_error_summary";
pub const TOOL_GET_METRICS: &str = "get_metrics";
pub const TOOL_SEARCH_KNOWLEDGE: &str = "search_knowledge";

/// 注册内置工具；日志源 / 指标源缺省时对应工具不注册
pub async fn register_builtin_tools(
    registry: &mut ToolRegistry,
    config: &ToolsSection,
    logs: Option<Arc<dyn LogSource>>,
    metrics: Option<Arc<dyn MetricSource>>,
    knowledge: Arc<KnowledgeBase>,
    knowledge_top_k: usize,
    knowledge_threshold: f32,
) {
    if let Some(logs) = logs {
        registry
            .register(NodeLogTool::new(logs.clone(), config.log_max_lines))
            .await;
        registry
            .register(SearchLogsTool::new(logs.clone(), config.log_max_lines))
            .await;
        registry
            .register(ErrorSummaryTool::new(logs, config.log_max_lines))
            .await;
    }
    if let Some(metrics) = metrics {
        registry.register(MetricsTool::new(metrics)).await;
    }
    registry
        .register(KnowledgeSearchTool::new(
            knowledge,
            knowledge_top_k,
            knowledge_threshold,
        ))
        .await;
    tracing::info!(tools = ?registry.tool_names(), "builtin tools registered");
}
