//! 故障诊断编排器
//!
//! 分类 -> 专家选择 -> 专家并发诊断 -> 讨论合成。唯一做扇出的组件：
//! JoinSet + Semaphore 工作池（容量 min(专家数, max_concurrency)），每个专家有独立截止时间，
//! 全局截止时间到达时取消所有专家，宽限期后仍未返回的任务被中止并记为 timeout。
//! 除构造时的配置校验外不返回错误，调用方总能拿到一份报告。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{DiagnosisSection, KnowledgeSection};
use crate::core::{DiagnosisError, SessionSupervisor, TaskScheduler};
use crate::diagnosis::events::emit;
use crate::diagnosis::{
    ClassificationResult, ClassifierConfig, DiagnosisEvent, DiagnosisOutcome, DiagnosisReport,
    DiscussionConfig, DiscussionSynthesizer, EventSender, ExpertAgent, ExpertConfig, ExpertDeps,
    ExpertDiagnosis, ExpertSelection, ExpertSelector, FaultClassifier, GlobalContext,
};

/// 超时与并发限制
#[derive(Debug, Clone)]
pub struct DiagnosisLimits {
    pub global_timeout: Duration,
    pub per_expert_timeout: Duration,
    pub cancel_grace: Duration,
    pub max_concurrency: usize,
}

impl DiagnosisLimits {
    fn from_section(section: &DiagnosisSection) -> Result<Self, DiagnosisError> {
        if section.global_timeout_ms == 0 || section.per_expert_timeout_ms == 0 {
            return Err(DiagnosisError::Config("timeouts must be non-zero".into()));
        }
        if section.per_expert_timeout_ms >= section.global_timeout_ms {
            return Err(DiagnosisError::Config(format!(
                "per_expert_timeout_ms ({}) must be shorter than global_timeout_ms ({})",
                section.per_expert_timeout_ms, section.global_timeout_ms
            )));
        }
        if section.max_concurrency == 0 || section.max_experts == 0 {
            return Err(DiagnosisError::Config(
                "max_concurrency and max_experts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&section.high_agreement_threshold) {
            return Err(DiagnosisError::Config(
                "high_agreement_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(Self {
            global_timeout: section.global_timeout(),
            per_expert_timeout: section.per_expert_timeout(),
            cancel_grace: section.cancel_grace(),
            max_concurrency: section.max_concurrency,
        })
    }
}

pub struct FaultOrchestrator {
    classifier: FaultClassifier,
    selector: ExpertSelector,
    discussion: DiscussionSynthesizer,
    deps: ExpertDeps,
    expert_config: ExpertConfig,
    limits: DiagnosisLimits,
    events: Option<EventSender>,
}

impl FaultOrchestrator {
    /// 校验配置并组装流水线；配置非法时返回 DiagnosisError::Config
    pub fn new(
        deps: ExpertDeps,
        diagnosis: &DiagnosisSection,
        knowledge: &KnowledgeSection,
    ) -> Result<Self, DiagnosisError> {
        let limits = DiagnosisLimits::from_section(diagnosis)?;
        let classifier = FaultClassifier::new(
            deps.engine.clone(),
            deps.taxonomy.clone(),
            ClassifierConfig {
                context_char_budget: diagnosis.context_char_budget,
                max_retries: diagnosis.classifier_max_retries,
            },
        );
        let selector = ExpertSelector::new(deps.taxonomy.clone(), diagnosis.max_experts);
        let discussion = DiscussionSynthesizer::new(
            deps.taxonomy.clone(),
            DiscussionConfig {
                high_agreement_threshold: diagnosis.high_agreement_threshold,
                inconclusive_candidates: diagnosis.inconclusive_candidates,
                narrate: diagnosis.narrate,
            },
        )
        .with_engine(deps.engine.clone());
        let expert_config = ExpertConfig {
            max_tool_rounds: diagnosis.max_tool_rounds,
            context_char_budget: diagnosis.context_char_budget,
            knowledge_top_k: knowledge.top_k,
            knowledge_threshold: knowledge.score_threshold,
            ..ExpertConfig::default()
        };
        Ok(Self {
            classifier,
            selector,
            discussion,
            deps,
            expert_config,
            limits,
            events: None,
        })
    }

    pub fn with_events(mut self, tx: EventSender) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn limits(&self) -> &DiagnosisLimits {
        &self.limits
    }

    pub fn deps(&self) -> &ExpertDeps {
        &self.deps
    }

    pub async fn diagnose(&self, query: &str, ctx: GlobalContext) -> DiagnosisReport {
        self.diagnose_detailed(query, ctx).await.report
    }

    pub async fn diagnose_detailed(&self, query: &str, ctx: GlobalContext) -> DiagnosisOutcome {
        self.diagnose_cancellable(query, ctx, None).await
    }

    /// 外部取消（如 Ctrl+C）经 parent 令牌传入，效果与全局超时相同
    pub async fn diagnose_cancellable(
        &self,
        query: &str,
        ctx: GlobalContext,
        parent: Option<&CancellationToken>,
    ) -> DiagnosisOutcome {
        let session = SessionSupervisor::new(self.limits.global_timeout, parent);
        let span = tracing::info_span!("diagnose", request_id = %session.request_id());
        self.run_pipeline(query, Arc::new(ctx), &session)
            .instrument(span)
            .await
    }

    async fn run_pipeline(
        &self,
        query: &str,
        ctx: Arc<GlobalContext>,
        session: &SessionSupervisor,
    ) -> DiagnosisOutcome {
        let request_id = session.request_id().to_string();
        tracing::info!(cluster = %ctx.cluster_state().summary(), "diagnosis started");

        let cancel = session.cancel_token();
        let mut classification = tokio::select! {
            biased;
            _ = cancel.cancelled() => ClassificationResult::unknown("请求已取消", 0),
            r = tokio::time::timeout_at(session.deadline(), self.classifier.classify(query, &ctx)) => {
                r.unwrap_or_else(|_| {
                    tracing::warn!("classification hit the global deadline");
                    ClassificationResult::unknown("分类超时", 0)
                })
            }
        };
        emit(
            self.events.as_ref(),
            DiagnosisEvent::ClassificationDone {
                request_id: request_id.clone(),
                fault_type: classification.primary_fault_type.clone(),
                confidence: classification.confidence,
                degraded: classification.degraded,
            },
        );

        self.selector.expand_related(&mut classification, ctx.cluster_state());
        let selection = self.selector.select(&classification);
        emit(
            self.events.as_ref(),
            DiagnosisEvent::ExpertsSelected {
                request_id: request_id.clone(),
                roles: selection.roles.clone(),
                fallback: selection.fallback,
            },
        );

        let diagnoses = self
            .run_experts(query, ctx, &classification, &selection, session)
            .await;

        let mut report = self.discussion.reconcile(&request_id, &classification, &diagnoses);
        if self.discussion.narrates() && report.narrative.is_none() && !session.is_cancelled() {
            report.narrative = tokio::time::timeout(
                session.remaining(),
                self.discussion.narrate(query, &report, &diagnoses),
            )
            .await
            .ok()
            .flatten();
        }

        tracing::info!(
            status = ?report.overall_status,
            elapsed_ms = session.elapsed().as_millis() as u64,
            "diagnosis finished"
        );
        emit(
            self.events.as_ref(),
            DiagnosisEvent::ReportReady {
                request_id,
                overall_status: report.overall_status,
                agreed_fault_type: report.agreed_fault_type.clone(),
            },
        );

        DiagnosisOutcome {
            classification,
            selection,
            diagnoses,
            report,
        }
    }

    /// 并发运行专家；结果按选择顺序排列，未返回的专家补为 timeout（被取消时）或 error
    async fn run_experts(
        &self,
        query: &str,
        ctx: Arc<GlobalContext>,
        classification: &ClassificationResult,
        selection: &ExpertSelection,
        session: &SessionSupervisor,
    ) -> Vec<ExpertDiagnosis> {
        let roles = &selection.roles;
        let scheduler = TaskScheduler::new(roles.len().min(self.limits.max_concurrency));
        let global_deadline = session.deadline();
        let started = Instant::now();
        let mut set = JoinSet::new();

        for (idx, role) in roles.iter().copied().enumerate() {
            let agent = ExpertAgent::for_role(role, self.deps.clone(), self.expert_config.clone())
                .with_events(self.events.clone());
            let scheduler = scheduler.clone();
            let token = session.child_token();
            let ctx = ctx.clone();
            let query = query.to_string();
            let classification = classification.clone();
            let per_expert = self.limits.per_expert_timeout;

            set.spawn(
                async move {
                    let permit = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        p = scheduler.acquire() => p.ok(),
                    };
                    let Some(_permit) = permit else {
                        return (idx, ExpertDiagnosis::timeout(role, Vec::new(), 0));
                    };
                    let deadline = (Instant::now() + per_expert).min(global_deadline);
                    let diagnosis = agent.run(&query, ctx, &classification, deadline, token).await;
                    (idx, diagnosis)
                }
                .in_current_span(),
            );
        }

        let mut results: Vec<Option<ExpertDiagnosis>> = vec![None; roles.len()];
        let cancel = session.cancel_token();
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((idx, d))) => results[idx] = Some(d),
                    Some(Err(e)) => tracing::error!("expert task failed: {}", e),
                },
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(global_deadline) => break,
            }
        }

        if !set.is_empty() {
            tracing::warn!(pending = set.len(), "cancelling unfinished experts");
            session.cancel();
            let grace = tokio::time::sleep(self.limits.cancel_grace);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    joined = set.join_next() => match joined {
                        None => break,
                        Some(Ok((idx, d))) => results[idx] = Some(d),
                        Some(Err(e)) => tracing::error!("expert task failed: {}", e),
                    },
                    _ = &mut grace => {
                        tracing::warn!(pending = set.len(), "grace period over, aborting experts");
                        set.abort_all();
                        break;
                    }
                }
            }
        }

        let cancelled = session.is_cancelled();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        results
            .into_iter()
            .zip(roles.iter().copied())
            .map(|(result, role)| match result {
                Some(d) => d,
                None if cancelled => ExpertDiagnosis::timeout(role, Vec::new(), elapsed_ms),
                None => ExpertDiagnosis::error(role, "expert task aborted", Vec::new(), elapsed_ms),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::FaultTaxonomy;
    use crate::knowledge::KnowledgeBase;
    use crate::llm::{HashingEmbedder, MockLlmClient, ReasoningEngine};
    use crate::tools::{ToolExecutor, ToolRegistry};

    fn deps() -> ExpertDeps {
        let embedder = Arc::new(HashingEmbedder::default());
        ExpertDeps {
            engine: ReasoningEngine::new(Arc::new(MockLlmClient::new())),
            executor: Arc::new(ToolExecutor::new(
                Arc::new(ToolRegistry::new(embedder.clone())),
                Duration::from_secs(1),
            )),
            knowledge: Arc::new(KnowledgeBase::in_memory(embedder)),
            taxonomy: Arc::new(FaultTaxonomy::builtin()),
        }
    }

    #[test]
    fn test_config_validation() {
        let knowledge = KnowledgeSection::default();
        assert!(FaultOrchestrator::new(deps(), &DiagnosisSection::default(), &knowledge).is_ok());

        let bad = DiagnosisSection {
            per_expert_timeout_ms: 5000,
            global_timeout_ms: 5000,
            ..DiagnosisSection::default()
        };
        assert!(matches!(
            FaultOrchestrator::new(deps(), &bad, &knowledge),
            Err(DiagnosisError::Config(_))
        ));

        let bad = DiagnosisSection {
            max_concurrency: 0,
            ..DiagnosisSection::default()
        };
        assert!(FaultOrchestrator::new(deps(), &bad, &knowledge).is_err());
    }

    #[tokio::test]
    async fn test_engine_down_yields_unavailable_report() {
        let orchestrator =
            FaultOrchestrator::new(deps(), &DiagnosisSection::default(), &KnowledgeSection::default())
                .unwrap();
        let outcome = orchestrator
            .diagnose_detailed("NameNode 无响应", GlobalContext::builder().build())
            .await;
        assert!(outcome.classification.primary_fault_type.is_unknown());
        assert!(outcome.selection.fallback);
        assert_eq!(
            outcome.report.overall_status,
            crate::diagnosis::OverallStatus::DiagnosisUnavailable
        );
        assert_eq!(outcome.diagnoses.len(), 1);
    }
}
