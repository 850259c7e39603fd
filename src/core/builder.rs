//! 流水线构建器：按配置组装 LLM、嵌入、知识库、工具与编排器
//!
//! CLI 与测试共用同一套组装逻辑；每个组件都可以用 with_* 显式替换（如注入 MockLlmClient、静态日志源）。

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, LlmSection};
use crate::core::{DiagnosisError, FaultOrchestrator};
use crate::diagnosis::{EventSender, ExpertDeps, FaultTaxonomy};
use crate::knowledge::{ChunkingConfig, KnowledgeBase};
use crate::llm::{
    create_deepseek_client, create_embedder_from_config, EmbeddingProvider, LlmClient,
    MockLlmClient, OpenAiClient, ReasoningEngine, RetryConfig, RetryingLlmClient,
};
use crate::tools::{
    register_builtin_tools, DirLogSource, JmxMetricSource, LogSource, MetricSource, Tool,
    ToolExecutor, ToolRegistry,
};

pub fn retry_config(section: &LlmSection) -> RetryConfig {
    RetryConfig {
        max_retries: section.max_retries,
        initial_backoff: Duration::from_millis(section.initial_backoff_ms),
        max_backoff: Duration::from_millis(section.max_backoff_ms),
        request_timeout: Duration::from_secs(section.request_timeout_secs),
    }
}

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock），并包上重试
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    let inner: Arc<dyn LlmClient> = match provider.as_str() {
        "deepseek" if has_deepseek_key || openai_key.is_some() => {
            let client = match cfg.llm.base_url.as_deref() {
                Some(base) => {
                    let key = std::env::var("DEEPSEEK_API_KEY").ok().or(openai_key);
                    let model = cfg.llm.model.as_deref().unwrap_or(crate::llm::DEEPSEEK_CHAT);
                    OpenAiClient::new(Some(base), model, key.as_deref())
                }
                None => create_deepseek_client(cfg.llm.model.as_deref()),
            };
            tracing::info!("Using DeepSeek LLM");
            Arc::new(client)
        }
        "openai" | "vllm" => {
            let model = cfg.llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            tracing::info!(model = %model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &model,
                openai_key.as_deref(),
            ))
        }
        "mock" => {
            tracing::warn!("Using Mock LLM, every diagnosis will be unavailable");
            Arc::new(MockLlmClient::new())
        }
        other => {
            tracing::warn!(provider = other, "No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
    };
    Arc::new(RetryingLlmClient::new(inner, retry_config(&cfg.llm)))
}

/// 按 [knowledge] 段打开知识库（有根目录时落盘，见 AppConfig::knowledge_root），必要时写入示例知识
pub async fn open_knowledge_base(
    cfg: &AppConfig,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Result<KnowledgeBase, DiagnosisError> {
    let section = &cfg.knowledge;
    let kb = match cfg.knowledge_root() {
        Some(root) => KnowledgeBase::open(root, embedder),
        None => KnowledgeBase::in_memory(embedder),
    }
    .with_lexical_min_score(section.lexical_min_score)
    .with_chunking(ChunkingConfig::new(section.chunk_size, section.chunk_overlap));
    if section.seed_samples {
        let added = kb.seed_sample_knowledge().await?;
        if added > 0 {
            tracing::info!(added, "sample knowledge seeded");
        }
    }
    Ok(kb)
}

pub struct PipelineBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    knowledge: Option<Arc<KnowledgeBase>>,
    log_source: Option<Arc<dyn LogSource>>,
    metric_source: Option<Arc<dyn MetricSource>>,
    extra_tools: Vec<Arc<dyn Tool>>,
    taxonomy: Option<FaultTaxonomy>,
    events: Option<EventSender>,
}

impl PipelineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            knowledge: None,
            log_source: None,
            metric_source: None,
            extra_tools: Vec::new(),
            taxonomy: None,
            events: None,
        }
    }

    /// 使用给定客户端（不再额外包重试）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_log_source(mut self, source: Arc<dyn LogSource>) -> Self {
        self.log_source = Some(source);
        self
    }

    pub fn with_metric_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.metric_source = Some(source);
        self
    }

    /// 追加工具；与内置工具同名时替换内置实现
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn with_taxonomy(mut self, taxonomy: FaultTaxonomy) -> Self {
        self.taxonomy = Some(taxonomy);
        self
    }

    pub fn with_events(mut self, tx: EventSender) -> Self {
        self.events = Some(tx);
        self
    }

    pub async fn build(self) -> Result<FaultOrchestrator, DiagnosisError> {
        let cfg = self.config;

        let taxonomy = match (self.taxonomy, &cfg.diagnosis.taxonomy_path) {
            (Some(t), _) => t,
            (None, Some(path)) => FaultTaxonomy::load(path)?,
            (None, None) => FaultTaxonomy::builtin(),
        };
        if taxonomy.is_empty() {
            return Err(DiagnosisError::Config("fault taxonomy is empty".into()));
        }

        let embedder = self
            .embedder
            .unwrap_or_else(|| create_embedder_from_config(&cfg.embedding));
        let knowledge = match self.knowledge {
            Some(kb) => kb,
            None => Arc::new(open_knowledge_base(&cfg, embedder.clone()).await?),
        };

        let log_source = self.log_source.or_else(|| {
            cfg.tools
                .log_dir
                .as_ref()
                .map(|dir| Arc::new(DirLogSource::new(dir)) as Arc<dyn LogSource>)
        });
        let metric_source = self.metric_source.or_else(|| {
            (!cfg.tools.jmx.is_empty()).then(|| {
                Arc::new(JmxMetricSource::new(
                    cfg.tools.jmx.clone(),
                    Duration::from_millis(cfg.tools.tool_timeout_ms),
                )) as Arc<dyn MetricSource>
            })
        });

        let mut registry = ToolRegistry::new(embedder);
        register_builtin_tools(
            &mut registry,
            &cfg.tools,
            log_source,
            metric_source,
            knowledge.clone(),
            cfg.knowledge.top_k,
            cfg.knowledge.score_threshold,
        )
        .await;
        for tool in self.extra_tools {
            registry.register_arc(tool).await;
        }
        let executor = ToolExecutor::new(
            Arc::new(registry),
            Duration::from_millis(cfg.tools.tool_timeout_ms),
        );

        let llm = self.llm.unwrap_or_else(|| create_llm_from_config(&cfg));
        let deps = ExpertDeps {
            engine: ReasoningEngine::new(llm),
            executor: Arc::new(executor),
            knowledge,
            taxonomy: Arc::new(taxonomy),
        };

        let orchestrator = FaultOrchestrator::new(deps, &cfg.diagnosis, &cfg.knowledge)?;
        Ok(match self.events {
            Some(tx) => orchestrator.with_events(tx),
            None => orchestrator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiagnosisSection;
    use crate::llm::HashingEmbedder;
    use crate::tools::{StaticLogSource, StaticMetricSource};

    #[tokio::test]
    async fn test_build_registers_builtin_tools() {
        let orchestrator = PipelineBuilder::new(AppConfig::default())
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_embedder(Arc::new(HashingEmbedder::default()))
            .with_log_source(Arc::new(StaticLogSource::default().with_log("namenode", "ERROR x")))
            .with_metric_source(Arc::new(StaticMetricSource::default().with_metric("namenode", "NumLiveDataNodes", 1i64)))
            .build()
            .await
            .unwrap();
        let names = orchestrator.deps().executor.registry().tool_names();
        assert_eq!(
            names,
            vec![
                "get_node_log".to_string(),
                "search_logs".to_string(),
                "get_error_summary".to_string(),
                "get_metrics".to_string(),
                "search_knowledge".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_knowledge_persists_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.app.data_dir = Some(dir.path().to_path_buf());

        let kb = open_knowledge_base(&cfg, Arc::new(HashingEmbedder::default()))
            .await
            .unwrap();
        kb.add_documents("HistoryCases", vec!["namenode stuck in safe mode".into()], vec![])
            .await
            .unwrap();
        assert!(dir.path().join("knowledge").join("HistoryCases").exists());

        let reopened = open_knowledge_base(&cfg, Arc::new(HashingEmbedder::default()))
            .await
            .unwrap();
        assert_eq!(reopened.len("HistoryCases").await, 1);
    }

    #[tokio::test]
    async fn test_invalid_limits_are_config_error() {
        let mut cfg = AppConfig::default();
        cfg.diagnosis = DiagnosisSection {
            per_expert_timeout_ms: 10_000,
            global_timeout_ms: 1_000,
            ..DiagnosisSection::default()
        };
        let result = PipelineBuilder::new(cfg)
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_embedder(Arc::new(HashingEmbedder::default()))
            .build()
            .await;
        assert!(matches!(result, Err(DiagnosisError::Config(_))));
    }
}
