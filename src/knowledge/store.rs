//! 按领域划分的知识库
//!
//! 相似度统一使用余弦相似度（越大越相似），阈值比较为 `score >= score_threshold`。
//! 嵌入后端不可用，或某领域的向量维度与查询向量不一致（如切换了嵌入模型）时，
//! 该次查询 / 该领域退化为 Jaccard 词法打分（同样越大越相似，使用独立的 lexical_min_score）。
//! 每个领域一把读写锁：检索并发只读，导入按领域串行。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use walkdir::WalkDir;

use crate::core::DiagnosisError;
use crate::knowledge::chunker::{Chunker, ChunkingConfig};
use crate::knowledge::{persistence, tokenizer};
use crate::llm::{cosine_similarity, EmbeddingProvider};

/// 内置领域，与专家角色对应
pub const DEFAULT_DOMAINS: &[&str] = &[
    "NameNodeExpert",
    "DataNodeExpert",
    "YARNExpert",
    "MapReduceExpert",
    "NetworkExpert",
    "HistoryCases",
];

const IMPORT_EXTENSIONS: &[&str] = &["txt", "md", "markdown"];

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeDocument {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    Cosine,
    Lexical,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub domain: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub score: f32,
    pub kind: ScoreKind,
}

#[derive(Debug, Default)]
pub struct DomainIndex {
    documents: Vec<KnowledgeDocument>,
    /// 维度不一致只告警一次
    dims_warned: AtomicBool,
}

impl DomainIndex {
    fn new(documents: Vec<KnowledgeDocument>) -> Self {
        Self {
            documents,
            dims_warned: AtomicBool::new(false),
        }
    }

    /// 所有文档向量都与查询向量同维时才能做余弦打分
    fn accepts_dims(&self, dims: usize) -> bool {
        self.documents.iter().all(|d| d.embedding.len() == dims)
    }

    fn warn_dims_once(&self, domain: &str, dims: usize) {
        if !self.dims_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                domain,
                query_dims = dims,
                "Knowledge vectors do not match the embedder's dimension, using lexical scoring for this domain"
            );
        }
    }
}

pub struct KnowledgeBase {
    root: Option<PathBuf>,
    embedder: Arc<dyn EmbeddingProvider>,
    domains: RwLock<BTreeMap<String, Arc<RwLock<DomainIndex>>>>,
    lexical_min_score: f32,
    chunker: Chunker,
}

impl KnowledgeBase {
    /// 纯内存知识库（不落盘），预建内置领域
    pub fn in_memory(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let domains = DEFAULT_DOMAINS
            .iter()
            .map(|d| (d.to_string(), Arc::new(RwLock::new(DomainIndex::default()))))
            .collect();
        Self {
            root: None,
            embedder,
            domains: RwLock::new(domains),
            lexical_min_score: 0.05,
            chunker: Chunker::default(),
        }
    }

    /// 打开持久化知识库：加载 root 下所有领域目录，缺失的内置领域以空索引补齐
    pub fn open(root: impl AsRef<Path>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let root = root.as_ref().to_path_buf();
        let mut names: Vec<String> = DEFAULT_DOMAINS.iter().map(|d| d.to_string()).collect();
        if let Ok(entries) = std::fs::read_dir(&root) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        if !names.iter().any(|n| n == name) {
                            names.push(name.to_string());
                        }
                    }
                }
            }
        }

        let mut total = 0;
        let domains = names
            .into_iter()
            .map(|name| {
                let documents = persistence::load_domain(&root.join(&name));
                total += documents.len();
                (name, Arc::new(RwLock::new(DomainIndex::new(documents))))
            })
            .collect::<BTreeMap<_, _>>();
        tracing::info!(root = %root.display(), domains = domains.len(), documents = total, "knowledge base opened");

        Self {
            root: Some(root),
            embedder,
            domains: RwLock::new(domains),
            lexical_min_score: 0.05,
            chunker: Chunker::default(),
        }
    }

    pub fn with_lexical_min_score(mut self, score: f32) -> Self {
        self.lexical_min_score = score;
        self
    }

    pub fn with_chunking(mut self, config: ChunkingConfig) -> Self {
        self.chunker = Chunker::new(config);
        self
    }

    pub async fn domains(&self) -> Vec<String> {
        self.domains.read().await.keys().cloned().collect()
    }

    pub async fn len(&self, domain: &str) -> usize {
        match self.domains.read().await.get(domain) {
            Some(handle) => handle.read().await.documents.len(),
            None => 0,
        }
    }

    async fn handle(&self, domain: &str) -> Arc<RwLock<DomainIndex>> {
        if let Some(h) = self.domains.read().await.get(domain) {
            return h.clone();
        }
        self.domains
            .write()
            .await
            .entry(domain.to_string())
            .or_default()
            .clone()
    }

    /// 嵌入并追加文档，随后重写该领域的索引文件。
    ///
    /// 不做去重：重复导入同一文本会产生重复条目，由调用方避免。
    pub async fn add_documents(
        &self,
        domain: &str,
        texts: Vec<String>,
        metadatas: Vec<BTreeMap<String, String>>,
    ) -> Result<usize, DiagnosisError> {
        if !metadatas.is_empty() && metadatas.len() != texts.len() {
            return Err(DiagnosisError::Knowledge(format!(
                "{} texts but {} metadata entries",
                texts.len(),
                metadatas.len()
            )));
        }

        let mut new_docs = Vec::with_capacity(texts.len());
        let mut metadatas = metadatas.into_iter();
        for text in texts {
            let embedding = self.embedder.embed(&text).await.map_err(|e| {
                DiagnosisError::Knowledge(format!("embedding failed ({}): {e}", self.embedder.name()))
            })?;
            new_docs.push(KnowledgeDocument {
                text,
                metadata: metadatas.next().unwrap_or_default(),
                embedding,
            });
        }
        let added = new_docs.len();

        let handle = self.handle(domain).await;
        let mut index = handle.write().await;
        if let (Some(old), Some(new)) = (index.documents.first(), new_docs.first()) {
            if old.embedding.len() != new.embedding.len() {
                tracing::warn!(
                    domain,
                    stored_dims = old.embedding.len(),
                    new_dims = new.embedding.len(),
                    "Adding vectors of a different dimension, domain will be scored lexically until rebuilt"
                );
            }
        }
        let mut documents = index.documents.clone();
        documents.extend(new_docs);
        if let Some(root) = &self.root {
            persistence::save_domain(&root.join(domain), &documents)
                .map_err(|e| DiagnosisError::Knowledge(format!("persist {domain}: {e:#}")))?;
        }
        index.documents = documents;
        index.dims_warned.store(false, Ordering::Relaxed);
        tracing::info!(domain, added, total = index.documents.len(), "knowledge added");
        Ok(added)
    }

    /// 检索：domain 为 None 时检索全部领域并按分数合并；结果按分数降序，至多 top_k 条
    pub async fn search(
        &self,
        domain: Option<&str>,
        query: &str,
        top_k: usize,
        score_threshold: f32,
    ) -> Vec<SearchHit> {
        if top_k == 0 || query.trim().is_empty() {
            return Vec::new();
        }

        let targets: Vec<(String, Arc<RwLock<DomainIndex>>)> = {
            let domains = self.domains.read().await;
            match domain {
                Some(d) => match domains.get(d) {
                    Some(h) => vec![(d.to_string(), h.clone())],
                    None => {
                        tracing::debug!(domain = d, "search on unknown domain");
                        return Vec::new();
                    }
                },
                None => domains.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            }
        };

        let query_vec = match self.embedder.embed(query).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Query embedding failed ({}), using lexical fallback", e);
                None
            }
        };
        let query_tokens = tokenizer::tokenize_to_set(query);

        let mut hits = Vec::new();
        for (name, handle) in targets {
            let index = handle.read().await;
            let cosine = query_vec.as_deref().filter(|q| index.accepts_dims(q.len()));
            if let (Some(q), None) = (query_vec.as_deref(), cosine) {
                index.warn_dims_once(&name, q.len());
            }
            for doc in &index.documents {
                let (score, kind) = match cosine {
                    Some(q) => (cosine_similarity(q, &doc.embedding), ScoreKind::Cosine),
                    None => (
                        tokenizer::jaccard_similarity(&query_tokens, &tokenizer::tokenize_to_set(&doc.text)),
                        ScoreKind::Lexical,
                    ),
                };
                let keep = match kind {
                    ScoreKind::Cosine => score >= score_threshold,
                    ScoreKind::Lexical => score > 0.0 && score >= self.lexical_min_score,
                };
                if keep {
                    hits.push(SearchHit {
                        domain: name.clone(),
                        text: doc.text.clone(),
                        metadata: doc.metadata.clone(),
                        score,
                        kind,
                    });
                }
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        hits
    }

    /// 长文档分块后导入，每块带 source 与 chunk 序号元数据
    pub async fn import_text(
        &self,
        domain: &str,
        source: &str,
        text: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<usize, DiagnosisError> {
        let chunks = self.chunker.split(text);
        if chunks.is_empty() {
            return Ok(0);
        }
        let metadatas = (0..chunks.len())
            .map(|i| {
                let mut m = metadata.clone();
                m.insert("source".to_string(), source.to_string());
                m.insert("chunk".to_string(), i.to_string());
                m
            })
            .collect();
        self.add_documents(domain, chunks, metadatas).await
    }

    /// 递归导入目录下的 .txt / .md / .markdown 文件；单个文件失败只告警
    pub async fn import_directory(&self, domain: &str, dir: &Path) -> Result<usize, DiagnosisError> {
        if !dir.is_dir() {
            return Err(DiagnosisError::Knowledge(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let mut total = 0;
        for entry in WalkDir::new(dir).sort_by_file_name().into_iter().flatten() {
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMPORT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if !entry.file_type().is_file() || !supported {
                continue;
            }
            match tokio::fs::read_to_string(path).await {
                Ok(text) => {
                    let source = path.display().to_string();
                    total += self.import_text(domain, &source, &text, BTreeMap::new()).await?;
                }
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(total)
    }

    /// 清空领域并重写索引文件
    pub async fn rebuild_domain(&self, domain: &str) -> Result<(), DiagnosisError> {
        let handle = self.handle(domain).await;
        let mut index = handle.write().await;
        if let Some(root) = &self.root {
            persistence::save_domain(&root.join(domain), &[])
                .map_err(|e| DiagnosisError::Knowledge(format!("persist {domain}: {e:#}")))?;
        }
        index.documents.clear();
        index.dims_warned.store(false, Ordering::Relaxed);
        tracing::info!(domain, "knowledge domain rebuilt");
        Ok(())
    }

    /// 为空领域写入示例知识，返回写入条数
    pub async fn seed_sample_knowledge(&self) -> Result<usize, DiagnosisError> {
        let mut added = 0;
        for (domain, entries) in SAMPLE_KNOWLEDGE {
            if self.len(domain).await > 0 {
                continue;
            }
            let texts = entries.iter().map(|(t, _, _)| t.to_string()).collect();
            let metadatas = entries
                .iter()
                .map(|(_, source, desc)| {
                    BTreeMap::from([
                        ("source".to_string(), source.to_string()),
                        ("desc".to_string(), desc.to_string()),
                    ])
                })
                .collect();
            added += self.add_documents(domain, texts, metadatas).await?;
        }
        Ok(added)
    }
}

type SampleEntry = (&'static str, &'static str, &'static str);

const SAMPLE_KNOWLEDGE: &[(&str, &[SampleEntry])] = &[
    (
        "NameNodeExpert",
        &[
            ("NameNode无法启动的常见原因：1) 配置文件错误 2) 端口被占用 3) 磁盘空间不足", "Hadoop官方文档", "NameNode启动问题"),
            ("NameNode启动失败时，检查hdfs-site.xml和core-site.xml配置是否正确", "故障案例", "配置检查"),
            ("NameNode内存溢出时，需要增加JVM堆内存大小，修改hadoop-env.sh中的HADOOP_HEAPSIZE", "故障案例", "内存问题"),
            ("NameNode is in safe mode: block reports below threshold. Check with hdfs dfsadmin -safemode get, leave with hdfs dfsadmin -safemode leave after DataNodes report", "故障案例", "安全模式"),
        ],
    ),
    (
        "DataNodeExpert",
        &[
            ("DataNode无法连接NameNode时，检查网络连接和防火墙设置", "故障案例", "连接问题"),
            ("DataNode磁盘空间不足会导致数据块复制失败", "故障案例", "存储问题"),
            ("DataNode心跳超时可能是网络延迟或NameNode负载过高", "故障案例", "心跳问题"),
            ("No heartbeat received from DataNode and NumLiveDataNodes=0: the DataNode process is down. Restart it with hdfs --daemon start datanode and verify with hdfs dfsadmin -report", "故障案例", "DataNode宕机"),
            ("Incompatible clusterIDs in DataNode log: clusterID in the DataNode VERSION file differs from the NameNode after reformat", "故障案例", "clusterID不一致"),
        ],
    ),
];
