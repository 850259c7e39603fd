//! 节点日志工具
//!
//! LogSource 抽象日志来源（目录 / 内存）；读取时过滤 INFO 行与 classpath 启动行，只保留尾部若干行。
//! 提供 get_node_log / search_logs / get_error_summary 三个工具。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::tools::{Tool, ToolArgs, TOOL_ERROR_SUMMARY, TOOL_NODE_LOG, TOOL_SEARCH_LOGS};

const MAX_SEARCH_MATCHES: usize = 50;

/// 日志来源
#[async_trait]
pub trait LogSource: Send + Sync {
    /// 指定节点最近的日志（已过滤、截尾）；节点不存在时 Err
    async fn node_log(&self, node: &str, max_lines: usize) -> Result<String, String>;

    async fn nodes(&self) -> Vec<String>;
}

/// 目录日志源：节点名匹配文件名，取最近修改的 *.log
#[derive(Debug, Clone)]
pub struct DirLogSource {
    dir: PathBuf,
}

impl DirLogSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn log_files(&self) -> Vec<(PathBuf, std::time::SystemTime)> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.path().extension().map(|x| x == "log").unwrap_or(false))
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((e.path(), modified))
            })
            .collect()
    }

    fn latest_for(&self, node: &str) -> Option<PathBuf> {
        let needle = node.to_lowercase();
        self.log_files()
            .into_iter()
            .filter(|(p, _)| {
                p.file_name()
                    .map(|n| n.to_string_lossy().to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .max_by_key(|(_, modified)| *modified)
            .map(|(p, _)| p)
    }
}

#[async_trait]
impl LogSource for DirLogSource {
    async fn node_log(&self, node: &str, max_lines: usize) -> Result<String, String> {
        let path = self
            .latest_for(node)
            .ok_or_else(|| format!("no log file for node '{}' in {}", node, self.dir.display()))?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("read {} failed: {}", path.display(), e))?;
        Ok(tail_lines(&filter_noise(&content), max_lines))
    }

    async fn nodes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .log_files()
            .into_iter()
            .filter_map(|(p, _)| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// 内存日志源：测试与快照回放用
#[derive(Debug, Clone, Default)]
pub struct StaticLogSource {
    logs: BTreeMap<String, String>,
}

impl StaticLogSource {
    pub fn new(logs: BTreeMap<String, String>) -> Self {
        Self { logs }
    }

    pub fn with_log(mut self, node: impl Into<String>, text: impl Into<String>) -> Self {
        self.logs.insert(node.into(), text.into());
        self
    }
}

#[async_trait]
impl LogSource for StaticLogSource {
    async fn node_log(&self, node: &str, max_lines: usize) -> Result<String, String> {
        let text = self
            .logs
            .get(node)
            .or_else(|| {
                let needle = node.to_lowercase();
                self.logs
                    .iter()
                    .find(|(k, _)| k.to_lowercase().contains(&needle))
                    .map(|(_, v)| v)
            })
            .ok_or_else(|| format!("no log for node '{}'", node))?;
        Ok(tail_lines(&filter_noise(text), max_lines))
    }

    async fn nodes(&self) -> Vec<String> {
        self.logs.keys().cloned().collect()
    }
}

fn info_line_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}[,\s]+\d+\s+INFO\s+").ok())
        .as_ref()
}

fn classpath_line_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)STARTUP_MSG:\s+classpath\s*=").ok())
        .as_ref()
}

/// 去掉 INFO 级别行与 classpath 启动行
pub fn filter_noise(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !info_line_re().map(|re| re.is_match(line)).unwrap_or(false))
        .filter(|line| !classpath_line_re().map(|re| re.is_match(line)).unwrap_or(false))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

fn is_error_line(line: &str) -> bool {
    line.contains("ERROR")
        || line.contains("FATAL")
        || line.contains("Exception")
        || line.contains(" WARN ")
}

/// get_node_log：读取某节点最新日志
pub struct NodeLogTool {
    source: Arc<dyn LogSource>,
    max_lines: usize,
}

impl NodeLogTool {
    pub fn new(source: Arc<dyn LogSource>, max_lines: usize) -> Self {
        Self { source, max_lines }
    }
}

#[async_trait]
impl Tool for NodeLogTool {
    fn name(&self) -> &str {
        TOOL_NODE_LOG
    }

    fn description(&self) -> &str {
        "Read the latest non-INFO log lines of a cluster node (namenode, datanode1, resourcemanager ...). Args: {\"node\": \"node name\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "node": { "type": "string" } },
            "required": ["node"]
        })
    }

    async fn invoke(&self, args: &str) -> Result<String, String> {
        let args = ToolArgs::parse(args);
        let node = args
            .get("node")
            .or_else(|| args.get("query"))
            .ok_or_else(|| "missing argument 'node'".to_string())?;
        tracing::info!(node = %node, "get_node_log");
        let text = self.source.node_log(&node, self.max_lines).await?;
        if text.trim().is_empty() {
            Ok(format!("节点 {} 最近日志过滤后为空（均为 INFO 级别）", node))
        } else {
            Ok(format!("=== {} ===\n{}", node, text))
        }
    }
}

/// search_logs：按关键词在各节点日志中检索
pub struct SearchLogsTool {
    source: Arc<dyn LogSource>,
    max_lines: usize,
}

impl SearchLogsTool {
    pub fn new(source: Arc<dyn LogSource>, max_lines: usize) -> Self {
        Self { source, max_lines }
    }
}

#[async_trait]
impl Tool for SearchLogsTool {
    fn name(&self) -> &str {
        TOOL_SEARCH_LOGS
    }

    fn description(&self) -> &str {
        "Search node logs for a keyword such as an exception name. Args: {\"keyword\": \"...\", \"node\": \"optional node name\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "keyword": { "type": "string" },
                "node": { "type": "string" }
            },
            "required": ["keyword"]
        })
    }

    async fn invoke(&self, args: &str) -> Result<String, String> {
        let args = ToolArgs::parse(args);
        let keyword = args
            .get("keyword")
            .or_else(|| args.get("query"))
            .ok_or_else(|| "missing argument 'keyword'".to_string())?;
        let nodes = match args.get("node") {
            Some(node) => vec![node],
            None => self.source.nodes().await,
        };
        let needle = keyword.to_lowercase();
        let mut matches = Vec::new();
        for node in &nodes {
            let Ok(text) = self.source.node_log(node, self.max_lines).await else {
                continue;
            };
            for line in text.lines().filter(|l| l.to_lowercase().contains(&needle)) {
                if matches.len() >= MAX_SEARCH_MATCHES {
                    break;
                }
                matches.push(format!("[{}] {}", node, line));
            }
        }
        if matches.is_empty() {
            Ok(format!("未在日志中找到关键词 '{}'", keyword))
        } else {
            Ok(format!("共 {} 条匹配:\n{}", matches.len(), matches.join("\n")))
        }
    }
}

/// get_error_summary：统计各节点 ERROR / FATAL / 异常行
pub struct ErrorSummaryTool {
    source: Arc<dyn LogSource>,
    max_lines: usize,
}

impl ErrorSummaryTool {
    pub fn new(source: Arc<dyn LogSource>, max_lines: usize) -> Self {
        Self { source, max_lines }
    }
}

#[async_trait]
impl Tool for ErrorSummaryTool {
    fn name(&self) -> &str {
        TOOL_ERROR_SUMMARY
    }

    fn description(&self) -> &str {
        "Summarize ERROR, FATAL and exception lines across all node logs"
    }

    async fn invoke(&self, _args: &str) -> Result<String, String> {
        let mut sections = Vec::new();
        for node in self.source.nodes().await {
            let Ok(text) = self.source.node_log(&node, self.max_lines).await else {
                continue;
            };
            let errors: Vec<&str> = text.lines().filter(|l| is_error_line(l)).collect();
            if errors.is_empty() {
                continue;
            }
            let last = errors.iter().rev().take(3).rev().cloned().collect::<Vec<_>>();
            sections.push(format!(
                "{}: {} 条异常\n  {}",
                node,
                errors.len(),
                last.join("\n  ")
            ));
        }
        if sections.is_empty() {
            Ok("各节点日志中未发现 ERROR / FATAL / 异常".to_string())
        } else {
            Ok(sections.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NN_LOG: &str = "2024-05-01 10:00:00,123 INFO org.apache.hadoop.hdfs.StateChange: BLOCK* registered\n\
STARTUP_MSG:   classpath = /opt/hadoop/share/a.jar:/opt/hadoop/share/b.jar\n\
2024-05-01 10:00:01,456 WARN org.apache.hadoop.hdfs.server.blockmanagement: Under replicated blocks: 12\n\
2024-05-01 10:00:02,789 ERROR org.apache.hadoop.hdfs.server.namenode.NameNode: java.io.IOException: Incompatible clusterIDs";

    fn source() -> Arc<dyn LogSource> {
        Arc::new(
            StaticLogSource::default()
                .with_log("namenode", NN_LOG)
                .with_log("datanode1", "2024-05-01 10:00:00,000 INFO ok"),
        )
    }

    #[test]
    fn test_filter_noise_drops_info_and_classpath() {
        let filtered = filter_noise(NN_LOG);
        assert!(!filtered.contains(" INFO "));
        assert!(!filtered.contains("classpath"));
        assert!(filtered.contains("Under replicated"));
        assert!(filtered.contains("Incompatible clusterIDs"));
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }

    #[tokio::test]
    async fn test_node_log_tool() {
        let tool = NodeLogTool::new(source(), 100);
        let out = tool.invoke(r#"{"node":"namenode"}"#).await.unwrap();
        assert!(out.contains("Incompatible clusterIDs"));
        let empty = tool.invoke(r#"{"node":"datanode1"}"#).await.unwrap();
        assert!(empty.contains("过滤后为空"));
        assert!(tool.invoke(r#"{"node":"nodemanager"}"#).await.is_err());
        assert!(tool.invoke("{}").await.is_err());
    }

    #[tokio::test]
    async fn test_search_logs_and_error_summary() {
        let search = SearchLogsTool::new(source(), 100);
        let out = search.invoke(r#"{"keyword":"clusterid"}"#).await.unwrap();
        assert!(out.contains("[namenode]"));
        let none = search.invoke("SafeModeException").await.unwrap();
        assert!(none.contains("未在日志中找到"));

        let summary = ErrorSummaryTool::new(source(), 100).invoke("{}").await.unwrap();
        assert!(summary.contains("namenode: 2 条异常"));
        assert!(!summary.contains("datanode1"));
    }

    #[tokio::test]
    async fn test_dir_log_source_picks_node_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hadoop-namenode.log"), NN_LOG).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ERROR ignored").unwrap();
        let src = DirLogSource::new(dir.path());
        assert_eq!(src.nodes().await, vec!["hadoop-namenode".to_string()]);
        let text = src.node_log("namenode", 10).await.unwrap();
        assert!(text.contains("Incompatible clusterIDs"));
        assert!(src.node_log("datanode9", 10).await.is_err());
    }
}
