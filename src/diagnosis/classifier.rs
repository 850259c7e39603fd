//! 故障分类器
//!
//! 把用户描述与全局上下文映射为一个 ClassificationResult：只允许分类表内的类型或 unknown，不调用工具。
//! 输出无法解析 / 类型不在表内时，经 RecoveryEngine 生成纠正提示重试；重试耗尽或推理引擎失败时退化为 unknown。

use std::sync::Arc;

use crate::core::{DiagnosisError, RecoveryAction, RecoveryEngine};
use crate::diagnosis::parse::parse_classification;
use crate::diagnosis::{ClassificationResult, FaultTaxonomy, FaultType, GlobalContext};
use crate::llm::{Message, Prompt, ReasoningEngine};
use crate::tools::classification_schema_json;

pub const CLASSIFIER_ROLE: &str = "fault_classifier";

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// 每个日志块 / 指标块的字符上限
    pub context_char_budget: usize,
    pub max_retries: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            context_char_budget: 2000,
            max_retries: 2,
        }
    }
}

pub struct FaultClassifier {
    engine: ReasoningEngine,
    taxonomy: Arc<FaultTaxonomy>,
    recovery: RecoveryEngine,
    config: ClassifierConfig,
}

impl FaultClassifier {
    pub fn new(engine: ReasoningEngine, taxonomy: Arc<FaultTaxonomy>, config: ClassifierConfig) -> Self {
        Self {
            engine,
            taxonomy,
            recovery: RecoveryEngine::new(),
            config,
        }
    }

    fn build_prompt(&self, query: &str, ctx: &GlobalContext) -> Prompt {
        let instructions = format!(
            "你是 Hadoop 集群故障分类器。根据用户描述、节点日志与监控指标，判断最可能的故障类型。\n\
             只能从下列故障类型中选择；无法判断时 fault_type 填 \"unknown\"。\n\n\
             ## 故障类型\n{}\n\n\
             ## 输出格式\n只输出一个 JSON 对象，符合以下 Schema:\n{}",
            self.taxonomy.render_for_prompt(),
            classification_schema_json()
        );
        let budget = self.config.context_char_budget;
        let mut prompt = Prompt::new(CLASSIFIER_ROLE, instructions)
            .with_block("用户描述", query)
            .with_block("集群状态", ctx.cluster_state().summary());
        for (node, body) in ctx.log_blocks(budget) {
            prompt.push_block(format!("日志: {node}"), body);
        }
        for (component, body) in ctx.metric_blocks(budget) {
            prompt.push_block(format!("指标: {component}"), body);
        }
        prompt
    }

    /// 分类；不会返回错误，失败时得到 degraded 的 unknown
    pub async fn classify(&self, query: &str, ctx: &GlobalContext) -> ClassificationResult {
        let base = self.build_prompt(query, ctx);
        let mut history: Vec<Message> = Vec::new();
        let mut attempts = 0u32;
        let mut last_error = String::new();

        while attempts <= self.config.max_retries {
            attempts += 1;
            let prompt = base.clone().with_history(history.clone());
            let raw = match self.engine.generate(&prompt).await {
                Ok(raw) => raw,
                Err(e) => {
                    let err = DiagnosisError::from(e);
                    tracing::warn!(attempts, "classifier degraded: {}", err);
                    return ClassificationResult::unknown(format!("推理引擎不可用: {err}"), attempts);
                }
            };

            match self.validate(&raw) {
                Ok(mut result) => {
                    result.attempts = attempts;
                    tracing::info!(
                        fault_type = %result.primary_fault_type,
                        confidence = result.confidence,
                        attempts,
                        "classification done"
                    );
                    return result;
                }
                Err(err) => {
                    tracing::warn!(attempts, "classification output rejected: {}", err);
                    last_error = err.to_string();
                    match self.recovery.handle(&err) {
                        RecoveryAction::RetryWithPrompt(correction) => {
                            history.push(Message::assistant(raw));
                            history.push(Message::user(correction));
                        }
                        _ => break,
                    }
                }
            }
        }

        ClassificationResult::unknown(
            format!("分类输出 {attempts} 次均无法使用: {last_error}"),
            attempts,
        )
    }

    fn validate(&self, raw: &str) -> Result<ClassificationResult, DiagnosisError> {
        let parsed = parse_classification(raw)?;
        let primary = self.taxonomy.resolve(&parsed.fault_type).ok_or_else(|| {
            DiagnosisError::Classification(format!(
                "fault_type '{}' 不在故障类型列表中",
                parsed.fault_type
            ))
        })?;

        let mut related: Vec<FaultType> = Vec::new();
        for name in &parsed.related {
            match self.taxonomy.resolve(name) {
                Some(t) if !t.is_unknown() && t != primary && !related.contains(&t) => related.push(t),
                Some(_) => {}
                None => tracing::debug!(related = %name, "dropping out-of-taxonomy related fault"),
            }
        }

        Ok(ClassificationResult {
            confidence: if primary.is_unknown() { parsed.confidence.min(0.5) } else { parsed.confidence },
            primary_fault_type: primary,
            related_fault_types: related,
            rationale: parsed.reasoning,
            attempts: 0,
            degraded: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient, MockReply};

    fn classifier(mock: MockLlmClient, max_retries: u32) -> (FaultClassifier, Arc<MockLlmClient>) {
        let mock = Arc::new(mock);
        let c = FaultClassifier::new(
            ReasoningEngine::new(mock.clone()),
            Arc::new(FaultTaxonomy::builtin()),
            ClassifierConfig {
                context_char_budget: 200,
                max_retries,
            },
        );
        (c, mock)
    }

    fn ctx() -> GlobalContext {
        GlobalContext::builder()
            .log("datanode1", format!("{}ERROR DataNode: Exception in BPOfferService", "x".repeat(5000)))
            .metric("namenode", "NumLiveDataNodes", 0i64)
            .build()
    }

    #[tokio::test]
    async fn test_classify_valid_output() {
        let (c, mock) = classifier(
            MockLlmClient::new().reply(
                CLASSIFIER_ROLE,
                r#"{"fault_type":"datanode_down","confidence":0.85,"related_faults":["under_replicated_blocks","datanode_down","disk_on_fire"],"reasoning":"no live datanodes"}"#,
            ),
            2,
        );
        let result = c.classify("DataNode 无法连接", &ctx()).await;
        assert_eq!(result.primary_fault_type.as_str(), "datanode_down");
        assert!((result.confidence - 0.85).abs() < 1e-6);
        assert_eq!(result.related_fault_types.len(), 1);
        assert_eq!(result.related_fault_types[0].as_str(), "under_replicated_blocks");
        assert!(!result.degraded);
        assert_eq!(result.attempts, 1);

        // 日志块按预算截断，保留尾部
        let request = &mock.requests_for(CLASSIFIER_ROLE)[0];
        let context = &request[2].content;
        assert!(context.contains("BPOfferService"));
        assert!(context.contains("已截断"));
        assert!(context.len() < 2000);
    }

    #[tokio::test]
    async fn test_malformed_then_valid_retries_with_correction() {
        let (c, mock) = classifier(
            MockLlmClient::new()
                .reply(CLASSIFIER_ROLE, "看起来是 DataNode 挂了")
                .reply(CLASSIFIER_ROLE, r#"{"fault_type":"datanode_down","confidence":0.7}"#),
            2,
        );
        let result = c.classify("q", &ctx()).await;
        assert_eq!(result.primary_fault_type.as_str(), "datanode_down");
        assert_eq!(result.attempts, 2);
        let second = &mock.requests_for(CLASSIFIER_ROLE)[1];
        assert!(second.last().unwrap().content.contains("JSON"));
    }

    #[tokio::test]
    async fn test_retries_exhausted_degrades_to_unknown() {
        let (c, mock) = classifier(
            MockLlmClient::new()
                .reply(CLASSIFIER_ROLE, r#"{"fault_type":"kernel_panic","confidence":0.9}"#)
                .reply(CLASSIFIER_ROLE, "still not json")
                .reply(CLASSIFIER_ROLE, "nope"),
            2,
        );
        let result = c.classify("q", &ctx()).await;
        assert!(result.primary_fault_type.is_unknown());
        assert_eq!(result.confidence, 0.0);
        assert!(result.degraded);
        assert_eq!(result.attempts, 3);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_engine_failure_degrades_immediately() {
        let (c, mock) = classifier(
            MockLlmClient::new().push(CLASSIFIER_ROLE, MockReply::Fail(LlmError::Api("down".into()))),
            2,
        );
        let result = c.classify("q", &ctx()).await;
        assert!(result.primary_fault_type.is_unknown());
        assert!(result.degraded);
        assert_eq!(mock.call_count(), 1);
    }
}
