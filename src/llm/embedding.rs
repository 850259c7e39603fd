//! 嵌入 API：供知识库与工具匹配使用
//!
//! - OpenAiEmbedder：调用 OpenAI 兼容的 /embeddings 端点
//! - HashingEmbedder：分词后特征哈希到固定维度，离线可用、结果确定
//! - DisabledEmbedder：始终失败，强制检索走词法回退

use std::collections::HashMap;
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::EmbeddingSection;
use crate::knowledge::tokenizer;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 将文本编码为向量；失败时返回错误字符串
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;

    fn name(&self) -> &str;
}

/// 余弦相似度，范围 [-1, 1]，越大越相似；维度不一致或零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty text".to_string());
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| e.to_string())?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;
        response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| "embedding response contained no vector".to_string())
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// 特征哈希嵌入：词 -> FNV-1a -> 桶，符号位取哈希最高位，最后 L2 归一化
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let tokens = tokenizer::tokenize(text);
        if tokens.is_empty() {
            return Err("no tokens to embed".to_string());
        }
        let mut counts: HashMap<&str, f32> = HashMap::new();
        for t in &tokens {
            *counts.entry(t.as_str()).or_default() += 1.0;
        }
        let mut v = vec![0.0f32; self.dims];
        for (token, count) in counts {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            v[bucket] += sign * (1.0 + count.ln());
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

/// 不可用的嵌入后端（provider = "none"）
#[derive(Debug, Default, Clone)]
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
        Err("embedding backend disabled".to_string())
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

/// 从应用配置创建嵌入提供方；openai 未配置 Key 时退回哈希嵌入
pub fn create_embedder_from_config(section: &EmbeddingSection) -> Arc<dyn EmbeddingProvider> {
    match section.provider.as_str() {
        "openai" => {
            let key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
            if key.is_empty() {
                tracing::warn!("OPENAI_API_KEY not set, falling back to hashing embedder");
                return Arc::new(HashingEmbedder::new(section.dims));
            }
            Arc::new(OpenAiEmbedder::new(
                section.base_url.as_deref(),
                &section.model,
                &key,
            ))
        }
        "none" => Arc::new(DisabledEmbedder),
        "hashing" => Arc::new(HashingEmbedder::new(section.dims)),
        other => {
            tracing::warn!("Unknown embedding provider '{}', using hashing embedder", other);
            Arc::new(HashingEmbedder::new(section.dims))
        }
    }
}
