//! 文档分块：按字符数切块，优先在段落 / 换行 / 句末处断开，块间保留重叠（UTF-8 安全）

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// 目标块大小（字符数）
    pub chunk_size: usize,
    /// 块之间的重叠（字符数）
    pub chunk_overlap: usize,
    /// 分隔符优先级（从高到低）
    pub separators: Vec<String>,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
            ..Default::default()
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            separators: ["\n\n", "\n", "。", ". ", "！", "？", "! ", "? ", " "]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let mut current = 0;

        while current < total {
            let target_end = (current + self.config.chunk_size).min(total);
            let mut end = target_end;

            // 不在文档末尾时，尝试在分隔符处断开
            if target_end < total {
                let slice: String = chars[current..target_end].iter().collect();
                for sep in &self.config.separators {
                    if let Some(pos) = slice.rfind(sep.as_str()) {
                        let to_sep = slice[..pos].chars().count() + sep.chars().count();
                        if to_sep > self.config.chunk_overlap {
                            end = current + to_sep;
                            break;
                        }
                    }
                }
            }

            let chunk: String = chars[current..end].iter().collect();
            let trimmed = chunk.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
            if end >= total {
                break;
            }

            let next = end.saturating_sub(self.config.chunk_overlap);
            current = if next > current { next } else { end };
        }

        chunks
    }
}
