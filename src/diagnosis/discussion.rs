//! 讨论 / 共识合成
//!
//! 只考虑 status=ok 且给出故障类型的诊断，按故障类型分组：
//! - 组聚合置信度取组内最大值；排序依次按聚合置信度、组大小、首次出现顺序
//! - 组大小 > 1 或聚合置信度 >= high_agreement_threshold 时形成共识；与次名完全持平时判为 inconclusive
//! - 任意两份故障类型不同的诊断记为一条冲突
//! - 修复步骤取支持共识的最强诊断，为空时回退到分类表模板；inconclusive 时合并前若干候选的步骤
//!
//! 可选地由推理引擎基于 ok 诊断生成一段讨论总结。

use std::sync::Arc;

use chrono::Utc;

use crate::core::DiagnosisError;
use crate::diagnosis::{
    ClassificationResult, Conflict, DiagnosisReport, ExpertDiagnosis, ExpertSummary,
    FaultCandidate, FaultTaxonomy, FaultType, OverallStatus,
};
use crate::llm::{Prompt, ReasoningEngine};
use crate::tools::executor::preview;

pub const MODERATOR_ROLE: &str = "discussion_moderator";

const SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct DiscussionConfig {
    pub high_agreement_threshold: f32,
    /// inconclusive 时合并修复步骤的候选个数
    pub inconclusive_candidates: usize,
    pub narrate: bool,
}

impl Default for DiscussionConfig {
    fn default() -> Self {
        Self {
            high_agreement_threshold: 0.75,
            inconclusive_candidates: 2,
            narrate: false,
        }
    }
}

struct Group<'a> {
    fault_type: FaultType,
    members: Vec<&'a ExpertDiagnosis>,
    aggregate: f32,
    first: usize,
}

pub struct DiscussionSynthesizer {
    taxonomy: Arc<FaultTaxonomy>,
    engine: Option<ReasoningEngine>,
    config: DiscussionConfig,
}

impl DiscussionSynthesizer {
    pub fn new(taxonomy: Arc<FaultTaxonomy>, config: DiscussionConfig) -> Self {
        Self {
            taxonomy,
            engine: None,
            config,
        }
    }

    pub fn with_engine(mut self, engine: ReasoningEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn narrates(&self) -> bool {
        self.config.narrate && self.engine.is_some()
    }

    fn group<'a>(diagnoses: &'a [ExpertDiagnosis]) -> Vec<Group<'a>> {
        let mut groups: Vec<Group<'a>> = Vec::new();
        for (i, d) in diagnoses.iter().enumerate() {
            let Some(fault) = d.fault_type.as_ref().filter(|_| d.is_ok()) else {
                continue;
            };
            match groups.iter_mut().find(|g| &g.fault_type == fault) {
                Some(g) => {
                    g.aggregate = g.aggregate.max(d.confidence);
                    g.members.push(d);
                }
                None => groups.push(Group {
                    fault_type: fault.clone(),
                    members: vec![d],
                    aggregate: d.confidence,
                    first: i,
                }),
            }
        }
        groups.sort_by(|a, b| {
            b.aggregate
                .partial_cmp(&a.aggregate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.members.len().cmp(&a.members.len()))
                .then(a.first.cmp(&b.first))
        });
        groups
    }

    /// 组内最强诊断的修复步骤；都为空时使用分类表模板
    fn remediation_of(&self, group: &Group<'_>) -> Vec<String> {
        let best = group
            .members
            .iter()
            .filter(|d| !d.remediation.is_empty())
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        match best {
            Some(d) => d.remediation.clone(),
            None => self.taxonomy.remediation_for(&group.fault_type),
        }
    }

    fn conflicts(diagnoses: &[ExpertDiagnosis]) -> Vec<Conflict> {
        let voting: Vec<(&ExpertDiagnosis, &FaultType)> = diagnoses
            .iter()
            .filter(|d| d.is_ok())
            .filter_map(|d| d.fault_type.as_ref().map(|t| (d, t)))
            .collect();
        let mut conflicts = Vec::new();
        for (i, (a, ta)) in voting.iter().enumerate() {
            for (b, tb) in voting.iter().skip(i + 1) {
                if ta != tb {
                    conflicts.push(Conflict {
                        expert_a: a.expert_role,
                        expert_b: b.expert_role,
                        diverging_claim: format!("{} 认为 {}，{} 认为 {}", a.expert_role, ta, b.expert_role, tb),
                    });
                }
            }
        }
        conflicts
    }

    /// 合成最终报告；没有可用诊断时为 diagnosis_unavailable，不返回错误
    pub fn reconcile(
        &self,
        request_id: &str,
        classification: &ClassificationResult,
        diagnoses: &[ExpertDiagnosis],
    ) -> DiagnosisReport {
        let per_expert_summaries = diagnoses
            .iter()
            .map(|d| ExpertSummary {
                role: d.expert_role,
                status: d.status,
                fault_type: d.fault_type.clone(),
                confidence: d.confidence,
                summary: preview(&d.narrative, SUMMARY_CHARS),
                tool_calls: d.tool_call_log.len(),
            })
            .collect();
        let groups = Self::group(diagnoses);
        let candidates: Vec<FaultCandidate> = groups
            .iter()
            .map(|g| FaultCandidate {
                fault_type: g.fault_type.clone(),
                confidence: g.aggregate,
                supporters: g.members.iter().map(|d| d.expert_role).collect(),
            })
            .collect();

        let mut report = DiagnosisReport {
            request_id: request_id.to_string(),
            overall_status: OverallStatus::DiagnosisUnavailable,
            agreed_fault_type: None,
            confidence: 0.0,
            classified_fault_type: classification.primary_fault_type.clone(),
            candidates,
            per_expert_summaries,
            conflicts: Self::conflicts(diagnoses),
            remediation_steps: Vec::new(),
            narrative: None,
            generated_at: Utc::now(),
        };

        let Some(winner) = groups.first() else {
            if !diagnoses.is_empty() && diagnoses.iter().all(|d| !d.is_ok()) {
                let err = DiagnosisError::AllExpertsFailed;
                tracing::warn!(request_id, "{}", err);
                let reasons: Vec<&str> = diagnoses.iter().map(|d| d.narrative.as_str()).collect();
                report.narrative = Some(format!("{err}: {}", reasons.join("; ")));
            } else {
                tracing::warn!(request_id, "no usable expert diagnosis");
            }
            return report;
        };

        let tied = groups.get(1).is_some_and(|second| {
            (second.aggregate - winner.aggregate).abs() < f32::EPSILON
                && second.members.len() == winner.members.len()
        });
        let agreed = !tied
            && (winner.members.len() > 1 || winner.aggregate >= self.config.high_agreement_threshold);

        report.confidence = winner.aggregate;
        if agreed {
            report.overall_status = OverallStatus::Consensus;
            report.agreed_fault_type = Some(winner.fault_type.clone());
            report.remediation_steps = self.remediation_of(winner);
        } else {
            report.overall_status = OverallStatus::Inconclusive;
            let mut steps: Vec<String> = Vec::new();
            for group in groups.iter().take(self.config.inconclusive_candidates.max(1)) {
                for step in self.remediation_of(group) {
                    if !steps.contains(&step) {
                        steps.push(step);
                    }
                }
            }
            report.remediation_steps = steps;
        }

        tracing::info!(
            request_id,
            status = ?report.overall_status,
            agreed = ?report.agreed_fault_type.as_ref().map(|t| t.as_str()),
            conflicts = report.conflicts.len(),
            "discussion reconciled"
        );
        report
    }

    /// 讨论总结；只引用 ok 诊断，失败时返回 None
    pub async fn narrate(
        &self,
        query: &str,
        report: &DiagnosisReport,
        diagnoses: &[ExpertDiagnosis],
    ) -> Option<String> {
        if !self.config.narrate {
            return None;
        }
        let engine = self.engine.as_ref()?;
        let ok: Vec<&ExpertDiagnosis> = diagnoses.iter().filter(|d| d.is_ok()).collect();
        if ok.is_empty() {
            return None;
        }

        let mut prompt = Prompt::new(
            MODERATOR_ROLE,
            "你是故障诊断讨论的主持人。综合各专家的结论，说明共识与分歧，并给出简明的最终结论与处置建议。\
             只能引用下面列出的专家意见，不要虚构其它专家。用中文回答，不超过 300 字。",
        )
        .with_block("用户描述", query)
        .with_block(
            "合成结果",
            format!(
                "状态: {:?}；共识故障: {}；置信度 {:.2}",
                report.overall_status,
                report
                    .agreed_fault_type
                    .as_ref()
                    .map(|t| t.as_str())
                    .unwrap_or("无"),
                report.confidence
            ),
        );
        for d in ok {
            prompt.push_block(
                format!("专家意见: {}", d.expert_role),
                format!(
                    "故障: {}（置信度 {:.2}）\n{}\n修复: {}",
                    d.fault_type.as_ref().map(|t| t.as_str()).unwrap_or("unknown"),
                    d.confidence,
                    d.narrative,
                    d.remediation.join("; ")
                ),
            );
        }

        match engine.generate(&prompt).await {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) => {
                tracing::warn!("discussion narrative failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::{DiagnosisStatus, ExpertRole};
    use crate::llm::MockLlmClient;

    fn taxonomy() -> Arc<FaultTaxonomy> {
        Arc::new(FaultTaxonomy::builtin())
    }

    fn ok(role: ExpertRole, fault: &str, confidence: f32, steps: &[&str]) -> ExpertDiagnosis {
        ExpertDiagnosis {
            expert_role: role,
            fault_type: taxonomy().resolve(fault),
            confidence,
            narrative: format!("{role} says {fault}"),
            evidence_refs: Vec::new(),
            remediation: steps.iter().map(|s| s.to_string()).collect(),
            tool_call_log: Vec::new(),
            status: DiagnosisStatus::Ok,
            elapsed_ms: 10,
        }
    }

    fn synth() -> DiscussionSynthesizer {
        DiscussionSynthesizer::new(taxonomy(), DiscussionConfig::default())
    }

    fn classification() -> ClassificationResult {
        ClassificationResult::unknown("t", 1)
    }

    #[test]
    fn test_two_agree_one_dissents() {
        let diagnoses = vec![
            ok(ExpertRole::Hdfs, "datanode_down", 0.9, &["restart datanode"]),
            ok(ExpertRole::Network, "datanode_down", 0.8, &["check network"]),
            ok(ExpertRole::Yarn, "nodemanager_down", 0.4, &[]),
        ];
        let report = synth().reconcile("r1", &classification(), &diagnoses);
        assert_eq!(report.overall_status, OverallStatus::Consensus);
        assert_eq!(report.agreed_fault_type.as_ref().map(|t| t.as_str()), Some("datanode_down"));
        assert!((report.confidence - 0.9).abs() < 1e-6);
        assert_eq!(report.remediation_steps, vec!["restart datanode".to_string()]);
        assert_eq!(report.conflicts.len(), 2);
        assert_eq!(report.candidates.len(), 2);
        assert_eq!(report.candidates[0].supporters.len(), 2);
        assert_eq!(report.per_expert_summaries.len(), 3);
    }

    #[test]
    fn test_single_low_confidence_is_inconclusive() {
        let report = synth().reconcile(
            "r",
            &classification(),
            &[ok(ExpertRole::Hdfs, "namenode_safemode", 0.5, &["leave safemode"])],
        );
        assert_eq!(report.overall_status, OverallStatus::Inconclusive);
        assert!(report.agreed_fault_type.is_none());
        assert_eq!(report.remediation_steps, vec!["leave safemode".to_string()]);
    }

    #[test]
    fn test_tie_is_inconclusive_with_merged_steps() {
        let diagnoses = vec![
            ok(ExpertRole::Hdfs, "datanode_down", 0.8, &["restart datanode", "check logs"]),
            ok(ExpertRole::Network, "network_partition", 0.8, &["check logs", "check firewall"]),
        ];
        let report = synth().reconcile("r", &classification(), &diagnoses);
        assert_eq!(report.overall_status, OverallStatus::Inconclusive);
        assert_eq!(
            report.remediation_steps,
            vec!["restart datanode".to_string(), "check logs".to_string(), "check firewall".to_string()]
        );
        assert_eq!(report.conflicts.len(), 1);
    }

    #[test]
    fn test_no_ok_diagnosis_is_unavailable() {
        let diagnoses = vec![
            ExpertDiagnosis::timeout(ExpertRole::Hdfs, Vec::new(), 100),
            ExpertDiagnosis::error(ExpertRole::Yarn, "boom", Vec::new(), 5),
        ];
        let report = synth().reconcile("r", &classification(), &diagnoses);
        assert_eq!(report.overall_status, OverallStatus::DiagnosisUnavailable);
        assert!(report.agreed_fault_type.is_none());
        assert!(report.conflicts.is_empty());
        assert_eq!(report.per_expert_summaries.len(), 2);
        assert!(diagnoses[0].narrative.contains("timed out"));
        let narrative = report.narrative.unwrap();
        assert!(narrative.starts_with("All experts failed"));
        assert!(narrative.contains("boom"));
    }

    #[test]
    fn test_empty_remediation_falls_back_to_taxonomy() {
        let report = synth().reconcile(
            "r",
            &classification(),
            &[ok(ExpertRole::Hdfs, "datanode_down", 0.95, &[])],
        );
        assert_eq!(report.overall_status, OverallStatus::Consensus);
        assert_eq!(
            report.remediation_steps,
            taxonomy().remediation_for(&taxonomy().resolve("datanode_down").unwrap())
        );
        assert!(!report.remediation_steps.is_empty());
    }

    #[tokio::test]
    async fn test_narrate_uses_only_ok_diagnoses() {
        let mock = Arc::new(MockLlmClient::new().reply(MODERATOR_ROLE, "  结论: DataNode 宕机  "));
        let synth = DiscussionSynthesizer::new(
            taxonomy(),
            DiscussionConfig {
                narrate: true,
                ..DiscussionConfig::default()
            },
        )
        .with_engine(ReasoningEngine::new(mock.clone()));
        let diagnoses = vec![
            ok(ExpertRole::Hdfs, "datanode_down", 0.9, &[]),
            ExpertDiagnosis::timeout(ExpertRole::Network, Vec::new(), 100),
        ];
        let report = synth.reconcile("r", &classification(), &diagnoses);
        let text = synth.narrate("q", &report, &diagnoses).await;
        assert_eq!(text.as_deref(), Some("结论: DataNode 宕机"));
        let request = &mock.requests_for(MODERATOR_ROLE)[0];
        assert!(request[2].content.contains("hdfs_expert"));
        assert!(!request[2].content.contains("network_expert"));
    }
}
