//! search_knowledge：检索领域知识库

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::knowledge::KnowledgeBase;
use crate::tools::{Tool, ToolArgs, TOOL_SEARCH_KNOWLEDGE};

pub struct KnowledgeSearchTool {
    knowledge: Arc<KnowledgeBase>,
    top_k: usize,
    score_threshold: f32,
}

impl KnowledgeSearchTool {
    pub fn new(knowledge: Arc<KnowledgeBase>, top_k: usize, score_threshold: f32) -> Self {
        Self {
            knowledge,
            top_k,
            score_threshold,
        }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        TOOL_SEARCH_KNOWLEDGE
    }

    fn description(&self) -> &str {
        "Search the fault knowledge base for known causes and fixes. Args: {\"query\": \"...\", \"domain\": \"optional, e.g. DataNodeExpert\", \"top_k\": 3}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "domain": { "type": "string" },
                "top_k": { "type": "integer" }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, args: &str) -> Result<String, String> {
        let args = ToolArgs::parse(args);
        let query = args
            .get("query")
            .ok_or_else(|| "missing argument 'query'".to_string())?;
        let domain = args.get("domain");
        let top_k = args.get_usize("top_k").unwrap_or(self.top_k).clamp(1, 10);

        let hits = self
            .knowledge
            .search(domain.as_deref(), &query, top_k, self.score_threshold)
            .await;
        if hits.is_empty() {
            return Ok("未找到相关知识".to_string());
        }

        let mut out = format!("找到 {} 条相关知识:", hits.len());
        for (i, hit) in hits.iter().enumerate() {
            out.push_str(&format!(
                "\n{}. [{}] (score {:.2}) {}",
                i + 1,
                hit.domain,
                hit.score,
                hit.text
            ));
            if let Some(source) = hit.metadata.get("source") {
                out.push_str(&format!("\n   来源: {}", source));
            }
            if let Some(desc) = hit.metadata.get("desc") {
                out.push_str(&format!("\n   说明: {}", desc));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;

    #[tokio::test]
    async fn test_search_knowledge_tool() {
        let kb = Arc::new(KnowledgeBase::in_memory(Arc::new(HashingEmbedder::default())));
        kb.seed_sample_knowledge().await.unwrap();
        let tool = KnowledgeSearchTool::new(kb, 3, 0.1);

        let out = tool
            .invoke(r#"{"query":"Incompatible clusterIDs in DataNode log","domain":"DataNodeExpert"}"#)
            .await
            .unwrap();
        assert!(out.starts_with("找到"));
        assert!(out.contains("clusterID"));

        let none = tool
            .invoke(r#"{"query":"anything","domain":"HistoryCases"}"#)
            .await
            .unwrap();
        assert_eq!(none, "未找到相关知识");
        assert!(tool.invoke("").await.is_err());
    }
}
