//! 专家 Agent
//!
//! 有限状态循环 Observe -> Decide -> Act -> Terminate：
//! - Observe：人设、领域知识、全局上下文（截断）、分类结果、工具结果历史、推荐工具
//! - Decide：推理引擎返回工具请求或最终诊断 JSON（自由文本按叙述解析）
//! - Act：经 ToolExecutor 调用白名单内的工具，失败作为观察结果反馈
//! - Terminate：给出诊断；达到 max_tool_rounds 时强制作答；超时 / 取消时返回 status=timeout 与已完成的工具记录
//!
//! 每个 await 都与取消令牌和专家截止时间竞争，保证按时返回。

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{DiagnosisError, RecoveryAction, RecoveryEngine};
use crate::diagnosis::events::{emit, DiagnosisEvent, EventSender};
use crate::diagnosis::parse::{parse_decision, ExpertDecision, ParsedDiagnosis};
use crate::diagnosis::roles::RoleSpec;
use crate::diagnosis::{
    tail_chars, ClassificationResult, DiagnosisStatus, ExpertDiagnosis, ExpertRole, FaultTaxonomy,
    GlobalContext, ToolCallRecord, ToolOutcome,
};
use crate::knowledge::{KnowledgeBase, SearchHit};
use crate::llm::{Message, Prompt, ReasoningEngine};
use crate::tools::executor::preview;
use crate::tools::{final_diagnosis_schema_json, tool_call_schema_json, ToolExecutor};

const DEFAULT_CONFIDENCE: f32 = 0.5;
const OBSERVATION_PREVIEW_CHARS: usize = 200;

const FORCE_FINAL_PROMPT: &str = "工具调用次数已达上限。请不要再请求任何工具，\
直接根据已有信息输出最终诊断 JSON（action 为 \"final\"）。";

/// 专家共享的依赖（均为只读共享）
#[derive(Clone)]
pub struct ExpertDeps {
    pub engine: ReasoningEngine,
    pub executor: Arc<ToolExecutor>,
    pub knowledge: Arc<KnowledgeBase>,
    pub taxonomy: Arc<FaultTaxonomy>,
}

#[derive(Debug, Clone)]
pub struct ExpertConfig {
    pub max_tool_rounds: usize,
    pub context_char_budget: usize,
    pub knowledge_top_k: usize,
    pub knowledge_threshold: f32,
    /// 推荐工具个数，0 表示不推荐
    pub recommend_tools: usize,
}

impl Default for ExpertConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 3,
            context_char_budget: 2000,
            knowledge_top_k: 3,
            knowledge_threshold: 0.2,
            recommend_tools: 3,
        }
    }
}

/// 循环的非正常结束
enum LoopExit {
    /// 截止时间到达或被取消
    Interrupted,
    Failed(String),
}

pub struct ExpertAgent {
    role: ExpertRole,
    spec: &'static RoleSpec,
    deps: ExpertDeps,
    config: ExpertConfig,
    recovery: RecoveryEngine,
    events: Option<EventSender>,
}

impl ExpertAgent {
    pub fn for_role(role: ExpertRole, deps: ExpertDeps, config: ExpertConfig) -> Self {
        Self {
            role,
            spec: role.spec(),
            deps,
            config,
            recovery: RecoveryEngine::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, tx: Option<EventSender>) -> Self {
        self.events = tx;
        self
    }

    pub fn role(&self) -> ExpertRole {
        self.role
    }

    /// 本角色可用的工具：白名单与已注册工具的交集；通用专家可用全部工具
    pub fn allowed_tools(&self) -> Vec<String> {
        let registry = self.deps.executor.registry();
        if self.spec.tools.is_empty() {
            return registry.tool_names();
        }
        self.spec
            .tools
            .iter()
            .filter(|t| registry.contains(t))
            .map(|t| t.to_string())
            .collect()
    }

    /// 运行诊断；不返回错误，超时 / 取消 / 失败都体现在 status 中
    pub async fn run(
        &self,
        query: &str,
        ctx: Arc<GlobalContext>,
        classification: &ClassificationResult,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> ExpertDiagnosis {
        let start = Instant::now();
        let mut log: Vec<ToolCallRecord> = Vec::new();
        let result = self
            .run_loop(query, &ctx, classification, deadline, &cancel, &mut log)
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let diagnosis = match result {
            Ok(parsed) => self.finish(parsed, log, elapsed_ms),
            Err(LoopExit::Interrupted) => {
                tracing::warn!(role = %self.role, elapsed_ms, "expert interrupted");
                ExpertDiagnosis::timeout(self.role, log, elapsed_ms)
            }
            Err(LoopExit::Failed(reason)) => {
                tracing::warn!(role = %self.role, "expert failed: {}", reason);
                ExpertDiagnosis::error(self.role, reason, log, elapsed_ms)
            }
        };

        emit(
            self.events.as_ref(),
            DiagnosisEvent::ExpertFinished {
                role: self.role,
                status: diagnosis.status,
                fault_type: diagnosis.fault_type.clone(),
                elapsed_ms,
            },
        );
        diagnosis
    }

    async fn guarded<F: Future>(
        &self,
        fut: F,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => None,
            out = fut => Some(out),
        }
    }

    async fn run_loop(
        &self,
        query: &str,
        ctx: &GlobalContext,
        classification: &ClassificationResult,
        deadline: Instant,
        cancel: &CancellationToken,
        log: &mut Vec<ToolCallRecord>,
    ) -> Result<ParsedDiagnosis, LoopExit> {
        let allowed = self.allowed_tools();

        let knowledge = self
            .guarded(self.prefetch_knowledge(query, classification), deadline, cancel)
            .await
            .ok_or(LoopExit::Interrupted)?;
        let recommended = if self.config.recommend_tools > 0 {
            self.guarded(
                self.deps
                    .executor
                    .registry()
                    .match_tools(query, self.config.recommend_tools),
                deadline,
                cancel,
            )
            .await
            .ok_or(LoopExit::Interrupted)?
            .into_iter()
            .filter(|m| allowed.contains(&m.name))
            .map(|m| m.name)
            .collect()
        } else {
            Vec::new()
        };

        let base = self.build_prompt(query, ctx, classification, &allowed, &knowledge, &recommended);
        let mut history: Vec<Message> = Vec::new();
        let max_rounds = self.config.max_tool_rounds;

        for round in 1..=max_rounds + 1 {
            let forced = round > max_rounds;
            if forced {
                history.push(Message::user(FORCE_FINAL_PROMPT));
            }

            let prompt = base.clone().with_history(history.clone());
            let raw = match self
                .guarded(self.deps.engine.generate(&prompt), deadline, cancel)
                .await
            {
                None => return Err(LoopExit::Interrupted),
                Some(Ok(raw)) => raw,
                Some(Err(e)) => {
                    let err = DiagnosisError::from(e);
                    return match self.recovery.handle(&err) {
                        RecoveryAction::Abort => Err(LoopExit::Interrupted),
                        _ => Err(LoopExit::Failed(err.to_string())),
                    };
                }
            };

            let decision = parse_decision(&raw)
                .ok_or_else(|| LoopExit::Failed("推理引擎返回空输出".to_string()))?;

            let request = match decision {
                ExpertDecision::Final(parsed) => return Ok(parsed),
                ExpertDecision::CallTool(_) if forced => {
                    return Err(LoopExit::Failed(format!(
                        "达到工具调用上限 {max_rounds} 后仍请求工具"
                    )));
                }
                ExpertDecision::CallTool(request) => request,
            };

            tracing::info!(role = %self.role, round, tool = %request.tool, "expert tool call");
            emit(
                self.events.as_ref(),
                DiagnosisEvent::ToolCall {
                    role: self.role,
                    round,
                    tool: request.tool.clone(),
                    args: request.args.clone(),
                },
            );
            history.push(Message::assistant(raw));

            let started = Instant::now();
            let observation = self
                .guarded(
                    self.deps.executor.invoke(&request.tool, &request.args, &allowed),
                    deadline,
                    cancel,
                )
                .await;
            let Some(observation) = observation else {
                log.push(ToolCallRecord {
                    round,
                    tool: request.tool,
                    args: request.args,
                    outcome: ToolOutcome::Interrupted,
                    output: String::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                return Err(LoopExit::Interrupted);
            };

            emit(
                self.events.as_ref(),
                DiagnosisEvent::Observation {
                    role: self.role,
                    tool: observation.tool.clone(),
                    outcome: observation.outcome,
                    preview: preview(&observation.output, OBSERVATION_PREVIEW_CHARS),
                },
            );
            history.push(Message::user(format!(
                "工具 {} 返回:\n{}",
                observation.tool,
                tail_chars(&observation.output, self.config.context_char_budget)
            )));
            log.push(ToolCallRecord {
                round,
                tool: request.tool,
                args: request.args,
                outcome: observation.outcome,
                output: observation.output,
                duration_ms: observation.duration_ms,
            });
        }

        Err(LoopExit::Failed("诊断循环未产生结论".to_string()))
    }

    /// 在角色的知识领域中检索，合并后按分数取前 top_k
    async fn prefetch_knowledge(
        &self,
        query: &str,
        classification: &ClassificationResult,
    ) -> Vec<SearchHit> {
        let mut search_query = query.to_string();
        if let Some(entry) = self.deps.taxonomy.entry(&classification.primary_fault_type) {
            search_query.push(' ');
            search_query.push_str(&entry.description);
        }
        let mut hits = Vec::new();
        for domain in self.spec.knowledge_domains {
            hits.extend(
                self.deps
                    .knowledge
                    .search(
                        Some(domain),
                        &search_query,
                        self.config.knowledge_top_k,
                        self.config.knowledge_threshold,
                    )
                    .await,
            );
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(self.config.knowledge_top_k);
        hits
    }

    fn build_prompt(
        &self,
        query: &str,
        ctx: &GlobalContext,
        classification: &ClassificationResult,
        allowed: &[String],
        knowledge: &[SearchHit],
        recommended: &[String],
    ) -> Prompt {
        let instructions = format!(
            "{persona}\n\n\
             你每次只能输出一个 JSON 对象，二选一:\n\
             1. 需要更多信息时请求工具，格式:\n{tool_schema}\n\
             2. 信息足够时给出最终诊断（action 为 \"final\"），格式:\n{final_schema}\n\n\
             fault_type 必须取自故障类型列表或 \"unknown\"。最多调用 {rounds} 次工具。\n\n\
             ## 可用工具\n{tools}\n\n## 故障类型\n{taxonomy}",
            persona = self.spec.persona,
            tool_schema = tool_call_schema_json(),
            final_schema = final_diagnosis_schema_json(),
            rounds = self.config.max_tool_rounds,
            tools = self.deps.executor.registry().describe(allowed),
            taxonomy = self.deps.taxonomy.render_for_prompt(),
        );

        let budget = self.config.context_char_budget;
        let related = classification
            .related_fault_types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let mut prompt = Prompt::new(self.role.as_str(), instructions)
            .with_block("用户描述", query)
            .with_block(
                "初步分类",
                format!(
                    "{} (置信度 {:.2})；相关: {}\n{}",
                    classification.primary_fault_type,
                    classification.confidence,
                    if related.is_empty() { "无" } else { related.as_str() },
                    classification.rationale
                ),
            )
            .with_block("集群状态", ctx.cluster_state().summary());
        for (node, body) in ctx.log_blocks(budget) {
            prompt.push_block(format!("日志: {node}"), body);
        }
        for (component, body) in ctx.metric_blocks(budget) {
            prompt.push_block(format!("指标: {component}"), body);
        }
        if !knowledge.is_empty() {
            let body = knowledge
                .iter()
                .map(|h| format!("- [{}] {}", h.domain, h.text))
                .collect::<Vec<_>>()
                .join("\n");
            prompt.push_block("相关知识", body);
        }
        if !recommended.is_empty() {
            prompt.push_block("推荐工具", recommended.join(", "));
        }
        prompt
    }

    fn finish(&self, parsed: ParsedDiagnosis, log: Vec<ToolCallRecord>, elapsed_ms: u64) -> ExpertDiagnosis {
        let taxonomy = &self.deps.taxonomy;
        let fault_type = parsed
            .fault_type
            .as_deref()
            .and_then(|name| taxonomy.resolve(name))
            .or_else(|| taxonomy.find_mentioned(&parsed.raw))
            .filter(|t| !t.is_unknown());

        let mut evidence_refs = parsed.evidence;
        if evidence_refs.is_empty() {
            evidence_refs = log
                .iter()
                .filter(|r| r.outcome == ToolOutcome::Ok)
                .map(|r| format!("{}#{}", r.tool, r.round))
                .collect();
        }

        let narrative = if parsed.root_cause.is_empty() {
            preview(&parsed.raw, 500)
        } else {
            parsed.root_cause
        };

        tracing::info!(
            role = %self.role,
            fault_type = ?fault_type.as_ref().map(|t| t.as_str()),
            tool_calls = log.len(),
            "expert diagnosis done"
        );

        ExpertDiagnosis {
            expert_role: self.role,
            fault_type,
            confidence: parsed.confidence.unwrap_or(DEFAULT_CONFIDENCE),
            narrative,
            evidence_refs,
            remediation: parsed.remediation,
            tool_call_log: log,
            status: DiagnosisStatus::Ok,
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::llm::{HashingEmbedder, LlmError, MockLlmClient, MockReply};
    use crate::tools::ToolRegistry;

    const ROLE: &str = "hdfs_expert";

    async fn deps(mock: Arc<MockLlmClient>) -> ExpertDeps {
        let embedder = Arc::new(HashingEmbedder::default());
        let mut registry = ToolRegistry::new(embedder.clone());
        registry
            .register_fn("get_metrics", "fetch JMX metrics such as live datanodes", |_| async {
                Ok::<_, String>("0 live units, 0 dead units, JMX unreachable".to_string())
            })
            .await;
        registry
            .register_fn("get_node_log", "read the latest log lines of a node", |_| async {
                std::future::pending::<Result<String, String>>().await
            })
            .await;
        ExpertDeps {
            engine: ReasoningEngine::new(mock),
            executor: Arc::new(ToolExecutor::new(Arc::new(registry), Duration::from_secs(10))),
            knowledge: Arc::new(KnowledgeBase::in_memory(embedder)),
            taxonomy: Arc::new(FaultTaxonomy::builtin()),
        }
    }

    fn config(rounds: usize) -> ExpertConfig {
        ExpertConfig {
            max_tool_rounds: rounds,
            ..ExpertConfig::default()
        }
    }

    fn ctx() -> Arc<GlobalContext> {
        Arc::new(
            GlobalContext::builder()
                .log("datanode1", "ERROR DataNode: Connection refused")
                .build(),
        )
    }

    async fn run(mock: MockLlmClient, rounds: usize, budget: Duration) -> (ExpertDiagnosis, Arc<MockLlmClient>) {
        let mock = Arc::new(mock);
        let agent = ExpertAgent::for_role(ExpertRole::Hdfs, deps(mock.clone()).await, config(rounds));
        let classification = ClassificationResult::unknown("test", 1);
        let d = agent
            .run(
                "DataNode 无法连接",
                ctx(),
                &classification,
                Instant::now() + budget,
                CancellationToken::new(),
            )
            .await;
        (d, mock)
    }

    const FINAL: &str = r#"{"action":"final","fault_type":"datanode_down","confidence":0.9,"root_cause":"DataNode process down","evidence":["0 live units"],"remediation":["restart datanode"]}"#;

    #[tokio::test]
    async fn test_tool_then_final() {
        let (d, mock) = run(
            MockLlmClient::new()
                .reply(ROLE, r#"{"action":"call_tool","tool":"get_metrics","args":{}}"#)
                .reply(ROLE, FINAL),
            3,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(d.status, DiagnosisStatus::Ok);
        assert_eq!(d.fault_type.as_ref().map(|t| t.as_str()), Some("datanode_down"));
        assert!((d.confidence - 0.9).abs() < 1e-6);
        assert_eq!(d.tool_call_log.len(), 1);
        assert_eq!(d.tool_call_log[0].outcome, ToolOutcome::Ok);
        assert_eq!(d.remediation, vec!["restart datanode".to_string()]);

        let requests = mock.requests_for(ROLE);
        assert_eq!(requests.len(), 2);
        assert!(requests[1].iter().any(|m| m.content.contains("JMX unreachable")));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fed_back() {
        let (d, mock) = run(
            MockLlmClient::new()
                .reply(ROLE, r#"{"action":"call_tool","tool":"format_namenode","args":{}}"#)
                .reply(ROLE, FINAL),
            3,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(d.status, DiagnosisStatus::Ok);
        assert_eq!(d.tool_call_log[0].outcome, ToolOutcome::NotFound);
        let second = &mock.requests_for(ROLE)[1];
        assert!(second.iter().any(|m| m.content.contains("tool not found")));
    }

    #[tokio::test]
    async fn test_round_limit_forces_answer() {
        let call = r#"{"action":"call_tool","tool":"get_metrics","args":{}}"#;
        let (d, mock) = run(
            MockLlmClient::new().reply(ROLE, call).reply(ROLE, FINAL),
            1,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(d.status, DiagnosisStatus::Ok);
        let forced = &mock.requests_for(ROLE)[1];
        assert!(forced.last().unwrap().content.contains("上限"));

        let (d, _) = run(
            MockLlmClient::new().reply(ROLE, call).reply(ROLE, call),
            1,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(d.status, DiagnosisStatus::Error);
        assert_eq!(d.tool_call_log.len(), 1);
    }

    #[tokio::test]
    async fn test_narrative_answer_is_mined() {
        let (d, _) = run(
            MockLlmClient::new().reply(
                ROLE,
                "根本原因: DataNode 进程退出，属于 datanode_down\n修复步骤:\n1. 重启 DataNode\n2. 检查 dfsadmin -report",
            ),
            3,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(d.status, DiagnosisStatus::Ok);
        assert_eq!(d.fault_type.as_ref().map(|t| t.as_str()), Some("datanode_down"));
        assert_eq!(d.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(d.remediation.len(), 2);
    }

    #[tokio::test]
    async fn test_engine_failure_is_error_status() {
        let (d, _) = run(
            MockLlmClient::new().push(ROLE, MockReply::Fail(LlmError::Api("bad request".into()))),
            3,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(d.status, DiagnosisStatus::Error);
        assert!(d.narrative.contains("bad request"));
    }

    #[tokio::test]
    async fn test_hanging_tool_hits_deadline() {
        let started = std::time::Instant::now();
        let (d, _) = run(
            MockLlmClient::new().reply(ROLE, r#"{"action":"call_tool","tool":"get_node_log","args":{"node":"datanode1"}}"#),
            3,
            Duration::from_millis(200),
        )
        .await;
        assert_eq!(d.status, DiagnosisStatus::Timeout);
        assert_eq!(d.tool_call_log.len(), 1);
        assert_eq!(d.tool_call_log[0].outcome, ToolOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mock = Arc::new(MockLlmClient::new().push(ROLE, MockReply::Hang));
        let agent = ExpertAgent::for_role(ExpertRole::Hdfs, deps(mock).await, config(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let d = agent
            .run(
                "q",
                ctx(),
                &ClassificationResult::unknown("t", 1),
                Instant::now() + Duration::from_secs(5),
                cancel,
            )
            .await;
        assert_eq!(d.status, DiagnosisStatus::Timeout);
    }

    #[tokio::test]
    async fn test_allowed_tools_follow_role_whitelist() {
        let mock = Arc::new(MockLlmClient::new());
        let deps = deps(mock).await;
        let hdfs = ExpertAgent::for_role(ExpertRole::Hdfs, deps.clone(), config(3));
        assert_eq!(hdfs.allowed_tools(), vec!["get_node_log".to_string(), "get_metrics".to_string()]);
        let generic = ExpertAgent::for_role(ExpertRole::Generic, deps, config(3));
        assert_eq!(generic.allowed_tools().len(), 2);
    }
}
