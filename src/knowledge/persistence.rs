//! 领域索引持久化
//!
//! 每个领域一个目录：`index.json` 保存向量，`docstore.json` 保存并行的文本与元数据。
//! 写入先落临时文件再 rename；读取失败（缺失 / 损坏 / 两文件长度不一致）时返回空并记录降级日志。
//! 与声明维度不符的向量被丢弃（文本保留），该领域检索退化为词法打分。

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::knowledge::KnowledgeDocument;

pub const INDEX_FILE: &str = "index.json";
pub const DOCSTORE_FILE: &str = "docstore.json";

#[derive(Serialize, Deserialize)]
struct IndexFile {
    dims: usize,
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct DocRecord {
    text: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// 加载领域索引；目录不存在返回空，损坏时告警并返回空
pub fn load_domain(dir: &Path) -> Vec<KnowledgeDocument> {
    if !dir.join(DOCSTORE_FILE).exists() && !dir.join(INDEX_FILE).exists() {
        return Vec::new();
    }
    match try_load(dir) {
        Ok(docs) => docs,
        Err(e) => {
            tracing::warn!(
                "Knowledge index at {} unusable ({:#}), starting empty",
                dir.display(),
                e
            );
            Vec::new()
        }
    }
}

fn try_load(dir: &Path) -> anyhow::Result<Vec<KnowledgeDocument>> {
    let index: IndexFile = serde_json::from_str(
        &std::fs::read_to_string(dir.join(INDEX_FILE)).context("read index")?,
    )
    .context("parse index")?;
    let records: Vec<DocRecord> = serde_json::from_str(
        &std::fs::read_to_string(dir.join(DOCSTORE_FILE)).context("read docstore")?,
    )
    .context("parse docstore")?;

    anyhow::ensure!(
        index.vectors.len() == records.len(),
        "index has {} vectors but docstore has {} documents",
        index.vectors.len(),
        records.len()
    );

    let mut dropped = 0;
    let docs = records
        .into_iter()
        .zip(index.vectors)
        .map(|(r, mut embedding)| {
            if embedding.len() != index.dims {
                dropped += 1;
                embedding.clear();
            }
            KnowledgeDocument {
                text: r.text,
                metadata: r.metadata,
                embedding,
            }
        })
        .collect();
    if dropped > 0 {
        tracing::warn!(
            "Knowledge index at {} has {} vectors not matching declared dims {}, they will be scored lexically",
            dir.display(),
            dropped,
            index.dims
        );
    }
    Ok(docs)
}

/// 重写领域目录下的两个文件
pub fn save_domain(dir: &Path, docs: &[KnowledgeDocument]) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let index = IndexFile {
        dims: docs.first().map(|d| d.embedding.len()).unwrap_or(0),
        vectors: docs.iter().map(|d| d.embedding.clone()).collect(),
    };
    let records: Vec<DocRecord> = docs
        .iter()
        .map(|d| DocRecord {
            text: d.text.clone(),
            metadata: d.metadata.clone(),
        })
        .collect();
    write_atomic(&dir.join(INDEX_FILE), &serde_json::to_string(&index)?)?;
    write_atomic(&dir.join(DOCSTORE_FILE), &serde_json::to_string_pretty(&records)?)?;
    Ok(())
}

fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}
