//! 诊断流水线的数据模型：分类结果、专家选择、专家诊断、最终报告

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::DiagnosisError;
use crate::diagnosis::roles::ExpertRole;
use crate::diagnosis::taxonomy::FaultType;

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub primary_fault_type: FaultType,
    /// [0, 1]
    pub confidence: f32,
    pub related_fault_types: Vec<FaultType>,
    pub rationale: String,
    /// 实际调用推理引擎的次数
    pub attempts: u32,
    /// 重试耗尽或超时后退化的结果
    pub degraded: bool,
}

impl ClassificationResult {
    pub fn unknown(rationale: impl Into<String>, attempts: u32) -> Self {
        Self {
            primary_fault_type: FaultType::unknown(),
            confidence: 0.0,
            related_fault_types: Vec::new(),
            rationale: rationale.into(),
            attempts,
            degraded: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpertSelection {
    /// 非空，按优先级排列
    pub roles: Vec<ExpertRole>,
    /// 分类未映射到任何专科、改用通用专家
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisStatus {
    Ok,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok,
    NotFound,
    Error,
    Timeout,
    /// 调用进行中被专家超时 / 全局取消打断
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub round: usize,
    pub tool: String,
    pub args: String,
    pub outcome: ToolOutcome,
    pub output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpertDiagnosis {
    pub expert_role: ExpertRole,
    pub fault_type: Option<FaultType>,
    pub confidence: f32,
    pub narrative: String,
    pub evidence_refs: Vec<String>,
    pub remediation: Vec<String>,
    pub tool_call_log: Vec<ToolCallRecord>,
    pub status: DiagnosisStatus,
    pub elapsed_ms: u64,
}

impl ExpertDiagnosis {
    pub fn timeout(role: ExpertRole, log: Vec<ToolCallRecord>, elapsed_ms: u64) -> Self {
        Self {
            expert_role: role,
            fault_type: None,
            confidence: 0.0,
            narrative: format!(
                "{}（已完成 {} 次工具调用）",
                DiagnosisError::ExpertTimeout(role.to_string()),
                log.len()
            ),
            evidence_refs: Vec::new(),
            remediation: Vec::new(),
            tool_call_log: log,
            status: DiagnosisStatus::Timeout,
            elapsed_ms,
        }
    }

    pub fn error(
        role: ExpertRole,
        reason: impl std::fmt::Display,
        log: Vec<ToolCallRecord>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            expert_role: role,
            fault_type: None,
            confidence: 0.0,
            narrative: DiagnosisError::ExpertFailure {
                role: role.to_string(),
                reason: reason.to_string(),
            }
            .to_string(),
            evidence_refs: Vec::new(),
            remediation: Vec::new(),
            tool_call_log: log,
            status: DiagnosisStatus::Error,
            elapsed_ms,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == DiagnosisStatus::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Consensus,
    Inconclusive,
    DiagnosisUnavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaultCandidate {
    pub fault_type: FaultType,
    /// 组内最大置信度
    pub confidence: f32,
    pub supporters: Vec<ExpertRole>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub expert_a: ExpertRole,
    pub expert_b: ExpertRole,
    pub diverging_claim: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpertSummary {
    pub role: ExpertRole,
    pub status: DiagnosisStatus,
    pub fault_type: Option<FaultType>,
    pub confidence: f32,
    pub summary: String,
    pub tool_calls: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisReport {
    pub request_id: String,
    pub overall_status: OverallStatus,
    pub agreed_fault_type: Option<FaultType>,
    pub confidence: f32,
    /// 分类器给出的初判，供对照
    pub classified_fault_type: FaultType,
    pub candidates: Vec<FaultCandidate>,
    pub per_expert_summaries: Vec<ExpertSummary>,
    pub conflicts: Vec<Conflict>,
    pub remediation_steps: Vec<String>,
    pub narrative: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// diagnose_detailed 的完整产物（中间结果供观测与测试）
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisOutcome {
    pub classification: ClassificationResult,
    pub selection: ExpertSelection,
    pub diagnoses: Vec<ExpertDiagnosis>,
    pub report: DiagnosisReport,
}
