//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / invoke），注册时计算并缓存「name description」的嵌入，
//! match_tools 按余弦相似度排序（同分保持注册顺序）。注册表在启动时构建一次，之后以 Arc 只读共享。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::knowledge::tokenizer;
use crate::llm::{cosine_similarity, EmbeddingProvider};

/// 工具 trait：参数与结果都是文本；可恢复的失败返回 Err(描述)，由执行器转成观察结果
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能，也用于相关性匹配）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn invoke(&self, args: &str) -> Result<String, String>;
}

/// 闭包工具：测试与轻量扩展用
pub struct FnTool<F> {
    name: String,
    description: String,
    f: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, args: &str) -> Result<String, String> {
        (self.f)(args.to_string()).await
    }
}

/// 参数文本解析：JSON 对象按键取值；非 JSON 文本整体视为 `query`
#[derive(Debug, Clone, Default)]
pub struct ToolArgs {
    map: serde_json::Map<String, Value>,
}

impl ToolArgs {
    pub fn parse(args: &str) -> Self {
        let trimmed = args.trim();
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Self { map },
            _ if trimmed.is_empty() => Self::default(),
            _ => {
                let mut map = serde_json::Map::new();
                map.insert("query".to_string(), Value::String(trimmed.to_string()));
                Self { map }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.map.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}

pub struct ToolDescriptor {
    pub tool: Arc<dyn Tool>,
    /// 嵌入失败时为空，匹配时退回词法打分
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolMatch {
    pub name: String,
    pub score: f32,
}

pub struct ToolRegistry {
    embedder: Arc<dyn EmbeddingProvider>,
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            tools: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub async fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool)).await
    }

    pub async fn register_fn<F, Fut>(&mut self, name: &str, description: &str, f: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register(FnTool::new(name, description, f)).await
    }

    /// 同名工具重复注册时替换实现，保留原注册位置
    pub async fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let embedding = match self
            .embedder
            .embed(&format!("{} {}", name, tool.description()))
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(tool = %name, "Tool embedding failed ({}), lexical matching only", e);
                Vec::new()
            }
        };
        let descriptor = ToolDescriptor { tool, embedding };
        match self.index.get(&name) {
            Some(&i) => self.tools[i] = descriptor,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(descriptor);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| self.tools[i].tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// 按注册顺序
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|d| d.tool.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 对查询排序全部工具；同分按注册顺序（稳定排序）。
    /// 查询嵌入失败或任一工具缺少同维向量时，全部工具改用词法打分，两种分数不混排。
    pub async fn match_tools(&self, query: &str, top_k: usize) -> Vec<ToolMatch> {
        if top_k == 0 || self.tools.is_empty() {
            return Vec::new();
        }
        let query_vec = self
            .embedder
            .embed(query)
            .await
            .ok()
            .filter(|q| self.tools.iter().all(|d| d.embedding.len() == q.len()));
        let query_tokens = tokenizer::tokenize_to_set(query);

        let mut matches: Vec<ToolMatch> = self
            .tools
            .iter()
            .map(|d| {
                let score = match &query_vec {
                    Some(q) => cosine_similarity(q, &d.embedding),
                    None => tokenizer::jaccard_similarity(
                        &query_tokens,
                        &tokenizer::tokenize_to_set(&format!(
                            "{} {}",
                            d.tool.name(),
                            d.tool.description()
                        )),
                    ),
                };
                ToolMatch {
                    name: d.tool.name().to_string(),
                    score,
                }
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(top_k);
        matches
    }

    /// 指定工具的说明段落，用于 prompt 中的「可用工具」
    pub fn describe(&self, names: &[String]) -> String {
        names
            .iter()
            .filter_map(|n| self.get(n))
            .map(|t| {
                format!(
                    "- {}: {}\n  参数: {}",
                    t.name(),
                    t.description(),
                    t.parameters_schema()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{DisabledEmbedder, HashingEmbedder};

    async fn registry(embedder: Arc<dyn EmbeddingProvider>) -> ToolRegistry {
        let mut r = ToolRegistry::new(embedder);
        r.register_fn("get_node_log", "read the latest log lines of a cluster node", |_| async {
            Ok::<_, String>("log".to_string())
        })
        .await;
        r.register_fn("get_metrics", "fetch JMX metrics such as live datanodes", |_| async {
            Ok::<_, String>("metrics".to_string())
        })
        .await;
        r.register_fn("search_knowledge", "search the fault knowledge base", |_| async {
            Ok::<_, String>("kb".to_string())
        })
        .await;
        r
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let r = registry(Arc::new(HashingEmbedder::default())).await;
        assert_eq!(r.tool_names(), vec!["get_node_log", "get_metrics", "search_knowledge"]);
        assert!(r.contains("get_metrics"));
        assert_eq!(r.get("get_metrics").unwrap().invoke("{}").await.unwrap(), "metrics");
        assert!(r.get("nope").is_none());
    }

    #[tokio::test]
    async fn test_match_ranks_relevant_tool_first() {
        let r = registry(Arc::new(HashingEmbedder::default())).await;
        let m = r.match_tools("JMX metrics live datanodes", 2).await;
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].name, "get_metrics");
        assert!(m[0].score >= m[1].score);
    }

    /// 名称含 "offline" 的描述嵌入失败
    struct PartialEmbedder(HashingEmbedder);

    #[async_trait]
    impl EmbeddingProvider for PartialEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
            if text.contains("offline") {
                return Err("backend down".into());
            }
            self.0.embed(text).await
        }

        fn name(&self) -> &str {
            "partial"
        }
    }

    #[tokio::test]
    async fn test_missing_descriptor_embedding_scores_all_lexically() {
        let mut r = ToolRegistry::new(Arc::new(PartialEmbedder(HashingEmbedder::default())));
        r.register_fn("get_node_log", "read the latest log lines of a cluster node", |_| async {
            Ok::<_, String>("log".to_string())
        })
        .await;
        r.register_fn("offline_check", "check whether a node is offline", |_| async {
            Ok::<_, String>("up".to_string())
        })
        .await;

        let query = "latest node log lines";
        let matches = r.match_tools(query, 2).await;
        let q = tokenizer::tokenize_to_set(query);
        for m in &matches {
            let tool = r.get(&m.name).unwrap();
            let expected = tokenizer::jaccard_similarity(
                &q,
                &tokenizer::tokenize_to_set(&format!("{} {}", tool.name(), tool.description())),
            );
            assert!((m.score - expected).abs() < 1e-6);
        }
        assert_eq!(matches[0].name, "get_node_log");
    }

    #[tokio::test]
    async fn test_ties_keep_registration_order() {
        let r = registry(Arc::new(DisabledEmbedder)).await;
        let m = r.match_tools("zzz unrelated", 3).await;
        let names: Vec<_> = m.iter().map(|x| x.name.as_str()).collect();
        assert_eq!(names, vec!["get_node_log", "get_metrics", "search_knowledge"]);
        assert!(m.iter().all(|x| x.score == 0.0));
    }

    #[tokio::test]
    async fn test_reregister_replaces_in_place() {
        let mut r = registry(Arc::new(HashingEmbedder::default())).await;
        r.register_fn("get_node_log", "replacement", |_| async { Ok::<_, String>("new".to_string()) })
            .await;
        assert_eq!(r.len(), 3);
        assert_eq!(r.tool_names()[0], "get_node_log");
        assert_eq!(r.get("get_node_log").unwrap().invoke("").await.unwrap(), "new");
    }

    #[test]
    fn test_tool_args_parsing() {
        let a = ToolArgs::parse(r#"{"node": "dn1", "lines": 50}"#);
        assert_eq!(a.get("node").as_deref(), Some("dn1"));
        assert_eq!(a.get_usize("lines"), Some(50));
        let b = ToolArgs::parse("heartbeat");
        assert_eq!(b.get("query").as_deref(), Some("heartbeat"));
        assert!(ToolArgs::parse("").get("query").is_none());
    }
}
