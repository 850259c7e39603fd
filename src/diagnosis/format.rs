//! 诊断报告的 Markdown 渲染（CLI 输出用）

use crate::diagnosis::{DiagnosisReport, DiagnosisStatus, OverallStatus};

fn status_label(status: OverallStatus) -> &'static str {
    match status {
        OverallStatus::Consensus => "达成共识",
        OverallStatus::Inconclusive => "结论不一致",
        OverallStatus::DiagnosisUnavailable => "无法诊断",
    }
}

fn expert_status_label(status: DiagnosisStatus) -> &'static str {
    match status {
        DiagnosisStatus::Ok => "完成",
        DiagnosisStatus::Timeout => "超时",
        DiagnosisStatus::Error => "失败",
    }
}

pub fn render_markdown(report: &DiagnosisReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# 故障诊断报告 `{}`\n\n", report.request_id));
    out.push_str(&format!("- 状态: **{}**\n", status_label(report.overall_status)));
    match &report.agreed_fault_type {
        Some(fault) => out.push_str(&format!(
            "- 故障类型: **{}**（置信度 {:.0}%）\n",
            fault,
            report.confidence * 100.0
        )),
        None => out.push_str("- 故障类型: 未确定\n"),
    }
    out.push_str(&format!("- 初步分类: {}\n", report.classified_fault_type));
    out.push_str(&format!(
        "- 生成时间: {}\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S")
    ));

    if report.candidates.len() > 1 || report.agreed_fault_type.is_none() {
        if !report.candidates.is_empty() {
            out.push_str("\n## 候选故障\n\n");
            for c in &report.candidates {
                let supporters = c
                    .supporters
                    .iter()
                    .map(|r| r.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!(
                    "- {}（{:.0}%）: {}\n",
                    c.fault_type,
                    c.confidence * 100.0,
                    supporters
                ));
            }
        }
    }

    out.push_str("\n## 专家意见\n\n");
    for s in &report.per_expert_summaries {
        out.push_str(&format!(
            "### {} [{}]\n",
            s.role,
            expert_status_label(s.status)
        ));
        if let Some(fault) = &s.fault_type {
            out.push_str(&format!("故障: {}（{:.0}%），", fault, s.confidence * 100.0));
        }
        out.push_str(&format!("工具调用 {} 次\n\n{}\n\n", s.tool_calls, s.summary));
    }

    if !report.conflicts.is_empty() {
        out.push_str("## 分歧\n\n");
        for c in &report.conflicts {
            out.push_str(&format!("- {}\n", c.diverging_claim));
        }
        out.push('\n');
    }

    if !report.remediation_steps.is_empty() {
        out.push_str("## 修复步骤\n\n");
        for (i, step) in report.remediation_steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        out.push('\n');
    }

    if let Some(narrative) = &report.narrative {
        out.push_str("## 讨论总结\n\n");
        out.push_str(narrative);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::diagnosis::{ExpertRole, ExpertSummary, FaultTaxonomy, FaultType};

    #[test]
    fn test_render_consensus_report() {
        let fault = FaultTaxonomy::builtin().resolve("datanode_down");
        let report = DiagnosisReport {
            request_id: "req-1".into(),
            overall_status: OverallStatus::Consensus,
            agreed_fault_type: fault.clone(),
            confidence: 0.9,
            classified_fault_type: FaultType::unknown(),
            candidates: Vec::new(),
            per_expert_summaries: vec![ExpertSummary {
                role: ExpertRole::Hdfs,
                status: DiagnosisStatus::Ok,
                fault_type: fault,
                confidence: 0.9,
                summary: "DataNode process down".into(),
                tool_calls: 1,
            }],
            conflicts: Vec::new(),
            remediation_steps: vec!["restart datanode".into()],
            narrative: None,
            generated_at: Utc::now(),
        };
        let md = render_markdown(&report);
        assert!(md.contains("`req-1`"));
        assert!(md.contains("达成共识"));
        assert!(md.contains("datanode_down"));
        assert!(md.contains("1. restart datanode"));
        assert!(md.contains("### hdfs_expert [完成]"));
        assert!(!md.contains("## 分歧"));
    }
}
