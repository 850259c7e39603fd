//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RCA__*` 覆盖（双下划线表示嵌套，如 `RCA__LLM__PROVIDER=openai`）。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
    pub knowledge: KnowledgeSection,
    pub diagnosis: DiagnosisSection,
    pub tools: ToolsSection,
}

impl AppConfig {
    /// 知识库根目录：knowledge.root 优先，其次 `<app.data_dir>/knowledge`；都未设置时为 None（仅内存）
    pub fn knowledge_root(&self) -> Option<PathBuf> {
        self.knowledge
            .root
            .clone()
            .or_else(|| self.app.data_dir.as_ref().map(|d| d.join("knowledge")))
    }
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 数据目录；knowledge.root 未设置时知识库落在其下的 knowledge/
    pub data_dir: Option<PathBuf>,
}

/// [llm] 段：后端选择、单次请求超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// [embedding] 段：openai / hashing / none
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSection {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// hashing 嵌入维度
    #[serde(default = "default_embedding_dims")]
    pub dims: usize,
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dims() -> usize {
    256
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: None,
            dims: default_embedding_dims(),
        }
    }
}

/// [knowledge] 段：知识库根目录与检索参数
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeSection {
    /// 每个领域一个子目录；未设置时仅内存
    pub root: Option<PathBuf>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// 余弦相似度下限（越大越相似，score >= threshold 才保留）
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    /// 词法回退（Jaccard）下限
    #[serde(default = "default_lexical_min_score")]
    pub lexical_min_score: f32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// 领域为空时写入示例知识
    #[serde(default)]
    pub seed_samples: bool,
}

fn default_top_k() -> usize {
    3
}

fn default_score_threshold() -> f32 {
    0.2
}

fn default_lexical_min_score() -> f32 {
    0.05
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            root: None,
            top_k: default_top_k(),
            score_threshold: default_score_threshold(),
            lexical_min_score: default_lexical_min_score(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            seed_samples: false,
        }
    }
}

/// [diagnosis] 段：超时、并发上限、工具轮数、共识阈值
#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosisSection {
    #[serde(default = "default_global_timeout_ms")]
    pub global_timeout_ms: u64,
    /// 必须严格小于 global_timeout_ms
    #[serde(default = "default_per_expert_timeout_ms")]
    pub per_expert_timeout_ms: u64,
    /// 全局超时后等待专家收尾的宽限期
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_experts")]
    pub max_experts: usize,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// 每个日志 / 指标块的字符预算（保留最新内容）
    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,
    #[serde(default = "default_classifier_max_retries")]
    pub classifier_max_retries: u32,
    #[serde(default = "default_high_agreement_threshold")]
    pub high_agreement_threshold: f32,
    /// 不确定时汇总前几名候选的修复步骤
    #[serde(default = "default_inconclusive_candidates")]
    pub inconclusive_candidates: usize,
    /// 额外调用一次推理引擎生成综合叙述
    #[serde(default)]
    pub narrate: bool,
    /// 故障分类表 TOML；未设置时用内置表
    pub taxonomy_path: Option<PathBuf>,
}

fn default_global_timeout_ms() -> u64 {
    180_000
}

fn default_per_expert_timeout_ms() -> u64 {
    90_000
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

fn default_max_concurrency() -> usize {
    3
}

fn default_max_experts() -> usize {
    3
}

fn default_max_tool_rounds() -> usize {
    3
}

fn default_context_char_budget() -> usize {
    2000
}

fn default_classifier_max_retries() -> u32 {
    2
}

fn default_high_agreement_threshold() -> f32 {
    0.75
}

fn default_inconclusive_candidates() -> usize {
    2
}

impl Default for DiagnosisSection {
    fn default() -> Self {
        Self {
            global_timeout_ms: default_global_timeout_ms(),
            per_expert_timeout_ms: default_per_expert_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            max_concurrency: default_max_concurrency(),
            max_experts: default_max_experts(),
            max_tool_rounds: default_max_tool_rounds(),
            context_char_budget: default_context_char_budget(),
            classifier_max_retries: default_classifier_max_retries(),
            high_agreement_threshold: default_high_agreement_threshold(),
            inconclusive_candidates: default_inconclusive_candidates(),
            narrate: false,
            taxonomy_path: None,
        }
    }
}

impl DiagnosisSection {
    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms)
    }

    pub fn per_expert_timeout(&self) -> Duration {
        Duration::from_millis(self.per_expert_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// [tools] 段：工具超时、日志目录、JMX 端点
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（毫秒）
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// 节点日志目录（*.log）；未设置时不注册日志工具
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_max_lines")]
    pub log_max_lines: usize,
    /// 组件名 -> JMX URL，如 namenode = "http://namenode:9870/jmx"
    #[serde(default)]
    pub jmx: BTreeMap<String, String>,
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

fn default_log_max_lines() -> usize {
    200
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_ms: default_tool_timeout_ms(),
            log_dir: None,
            log_max_lines: default_log_max_lines(),
            jmx: BTreeMap::new(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 RCA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RCA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignoring", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RCA")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = AppConfig::default();
        assert!(cfg.diagnosis.per_expert_timeout() < cfg.diagnosis.global_timeout());
        assert_eq!(cfg.diagnosis.max_tool_rounds, 3);
        assert_eq!(cfg.knowledge.chunk_size, 500);
        assert_eq!(cfg.embedding.provider, "hashing");
    }

    #[test]
    fn test_partial_toml_keeps_field_defaults() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[diagnosis]\nmax_experts = 2\n[tools.jmx]\nnamenode = \"http://nn:9870/jmx\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.diagnosis.max_experts, 2);
        assert_eq!(cfg.diagnosis.max_tool_rounds, 3);
        assert_eq!(cfg.tools.jmx.get("namenode").map(String::as_str), Some("http://nn:9870/jmx"));
        assert_eq!(cfg.llm.provider, "deepseek");
    }

    #[test]
    fn test_knowledge_root_falls_back_to_data_dir() {
        let mut cfg = AppConfig::default();
        assert!(cfg.knowledge_root().is_none());

        cfg.app.data_dir = Some(PathBuf::from("/var/lib/rca"));
        assert_eq!(cfg.knowledge_root(), Some(PathBuf::from("/var/lib/rca/knowledge")));

        cfg.knowledge.root = Some(PathBuf::from("/srv/kb"));
        assert_eq!(cfg.knowledge_root(), Some(PathBuf::from("/srv/kb")));
    }
}
