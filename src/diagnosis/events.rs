//! 诊断过程事件：CLI 进度输出与外部观测用

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::diagnosis::{DiagnosisStatus, ExpertRole, FaultType, OverallStatus, ToolOutcome};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiagnosisEvent {
    ClassificationDone {
        request_id: String,
        fault_type: FaultType,
        confidence: f32,
        degraded: bool,
    },
    ExpertsSelected {
        request_id: String,
        roles: Vec<ExpertRole>,
        fallback: bool,
    },
    /// 专家发起工具调用
    ToolCall {
        role: ExpertRole,
        round: usize,
        tool: String,
        args: String,
    },
    /// 工具返回（预览）
    Observation {
        role: ExpertRole,
        tool: String,
        outcome: ToolOutcome,
        preview: String,
    },
    ExpertFinished {
        role: ExpertRole,
        status: DiagnosisStatus,
        fault_type: Option<FaultType>,
        elapsed_ms: u64,
    },
    ReportReady {
        request_id: String,
        overall_status: OverallStatus,
        agreed_fault_type: Option<FaultType>,
    },
}

pub type EventSender = UnboundedSender<DiagnosisEvent>;

/// 发送事件；接收端已关闭时静默丢弃
pub fn emit(tx: Option<&EventSender>, event: DiagnosisEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}
