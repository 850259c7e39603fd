//! 全局上下文快照
//!
//! 每次诊断请求构建一次，之后只读，以 `Arc<GlobalContext>` 在并发专家间共享。
//! `cluster_state` 由约定的指标键推导（存活 / 死亡单元数），键缺失时健康状态为 Unknown。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tools::logs::{filter_noise, tail_lines};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    /// 数值直接返回；文本取其中第一个整数（如 "0 live units"）
    pub fn as_count(&self) -> Option<u64> {
        match self {
            MetricValue::Number(n) if n.is_finite() && *n >= 0.0 => Some(*n as u64),
            MetricValue::Number(_) => None,
            MetricValue::Text(s) => first_integer(s),
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            MetricValue::Number(n) => write!(f, "{n}"),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

pub type MetricBundle = BTreeMap<String, MetricValue>;

fn first_integer(text: &str) -> Option<u64> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").ok())
        .as_ref()?
        .find(text)
        .and_then(|m| m.as_str().parse().ok())
}

const LIVE_KEYS: &[&str] = &["liveUnits", "NumLiveDataNodes", "live_datanodes"];
const DEAD_KEYS: &[&str] = &["deadUnits", "NumDeadDataNodes", "dead_datanodes"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterHealth {
    Healthy,
    Degraded,
    /// 存活单元为 0 且没有登记为死亡的单元（进程全部失联）
    NoLiveUnits,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterState {
    pub live_units: Option<u64>,
    pub dead_units: Option<u64>,
    pub health: ClusterHealth,
}

impl ClusterState {
    pub fn derive(metrics: &BTreeMap<String, MetricBundle>) -> Self {
        let lookup = |keys: &[&str]| {
            metrics
                .values()
                .flat_map(|bundle| keys.iter().filter_map(move |k| bundle.get(*k)))
                .find_map(MetricValue::as_count)
        };
        let live_units = lookup(LIVE_KEYS);
        let dead_units = lookup(DEAD_KEYS);
        let health = match (live_units, dead_units) {
            (None, None) => ClusterHealth::Unknown,
            (_, Some(dead)) if dead > 0 => ClusterHealth::Degraded,
            (Some(0), _) => ClusterHealth::NoLiveUnits,
            (Some(_), _) => ClusterHealth::Healthy,
            (None, Some(_)) => ClusterHealth::Unknown,
        };
        Self {
            live_units,
            dead_units,
            health,
        }
    }

    pub fn summary(&self) -> String {
        let fmt = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_else(|| "?".into());
        format!(
            "health={:?} live_units={} dead_units={}",
            self.health,
            fmt(self.live_units),
            fmt(self.dead_units)
        )
    }
}

/// 外部采集器提交的快照格式（JSON）
#[derive(Debug, Default, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default)]
    pub logs: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricBundle>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GlobalContext {
    logs: BTreeMap<String, String>,
    metrics: BTreeMap<String, MetricBundle>,
    cluster_state: ClusterState,
    collected_at: DateTime<Utc>,
}

impl GlobalContext {
    pub fn new(logs: BTreeMap<String, String>, metrics: BTreeMap<String, MetricBundle>) -> Self {
        let cluster_state = ClusterState::derive(&metrics);
        Self {
            logs,
            metrics,
            cluster_state,
            collected_at: Utc::now(),
        }
    }

    pub fn builder() -> GlobalContextBuilder {
        GlobalContextBuilder::default()
    }

    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        Self::new(snapshot.logs, snapshot.metrics)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read context {}", path.display()))?;
        let snapshot: ContextSnapshot = serde_json::from_str(&data)
            .with_context(|| format!("parse context {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// 读取目录下的 *.log 作为各节点日志（文件名去扩展名为节点名），过滤 INFO 行并保留尾部
    pub fn from_log_dir(dir: &Path, max_lines: usize) -> anyhow::Result<Self> {
        let mut logs = BTreeMap::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("read log dir {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().map(|e| e != "log").unwrap_or(true) {
                continue;
            }
            let Some(node) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("read log {}", path.display()))?;
            logs.insert(node, tail_lines(&filter_noise(&text), max_lines));
        }
        Ok(Self::new(logs, BTreeMap::new()))
    }

    pub fn logs(&self) -> &BTreeMap<String, String> {
        &self.logs
    }

    pub fn metrics(&self) -> &BTreeMap<String, MetricBundle> {
        &self.metrics
    }

    pub fn cluster_state(&self) -> &ClusterState {
        &self.cluster_state
    }

    pub fn collected_at(&self) -> DateTime<Utc> {
        self.collected_at
    }

    /// 每个节点一个块，各自截断到 budget 字符（保留尾部最新内容）
    pub fn log_blocks(&self, budget: usize) -> Vec<(String, String)> {
        self.logs
            .iter()
            .map(|(node, text)| (node.clone(), tail_chars(text, budget)))
            .collect()
    }

    /// 每个组件一个块（key = value 行），各自截断到 budget 字符
    pub fn metric_blocks(&self, budget: usize) -> Vec<(String, String)> {
        self.metrics
            .iter()
            .map(|(component, bundle)| {
                let body = bundle
                    .iter()
                    .map(|(k, v)| format!("{k} = {v}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                (component.clone(), tail_chars(&body, budget))
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct GlobalContextBuilder {
    logs: BTreeMap<String, String>,
    metrics: BTreeMap<String, MetricBundle>,
}

impl GlobalContextBuilder {
    pub fn log(mut self, node: impl Into<String>, text: impl Into<String>) -> Self {
        self.logs.insert(node.into(), text.into());
        self
    }

    pub fn metric(
        mut self,
        component: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<MetricValue>,
    ) -> Self {
        self.metrics
            .entry(component.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> GlobalContext {
        GlobalContext::new(self.logs, self.metrics)
    }
}

/// 保留最后 max 个字符；被截断时在开头标注省略的字符数
pub fn tail_chars(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    let skipped = total - max;
    let tail: String = text.chars().skip(skipped).collect();
    format!("...[前 {skipped} 字符已截断]\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_state_no_live_units() {
        let ctx = GlobalContext::builder()
            .metric("namenode", "liveUnits", 0i64)
            .metric("namenode", "deadUnits", 0i64)
            .build();
        let state = ctx.cluster_state();
        assert_eq!(state.live_units, Some(0));
        assert_eq!(state.dead_units, Some(0));
        assert_eq!(state.health, ClusterHealth::NoLiveUnits);
    }

    #[test]
    fn test_cluster_state_degraded_and_healthy() {
        let degraded = GlobalContext::builder()
            .metric("namenode", "NumLiveDataNodes", 2i64)
            .metric("namenode", "NumDeadDataNodes", 1i64)
            .build();
        assert_eq!(degraded.cluster_state().health, ClusterHealth::Degraded);

        let healthy = GlobalContext::builder()
            .metric("hdfs", "live_datanodes", "3 (via heartbeat)")
            .build();
        assert_eq!(healthy.cluster_state().live_units, Some(3));
        assert_eq!(healthy.cluster_state().health, ClusterHealth::Healthy);
    }

    #[test]
    fn test_cluster_state_unknown_without_keys() {
        let ctx = GlobalContext::builder()
            .metric("yarn", "NumActiveNMs", 2i64)
            .log("nn", "started")
            .build();
        assert_eq!(ctx.cluster_state().health, ClusterHealth::Unknown);
        assert_eq!(ctx.cluster_state().live_units, None);
    }

    #[test]
    fn test_snapshot_json_accepts_numbers_and_text() {
        let snapshot: ContextSnapshot = serde_json::from_str(
            r#"{"logs": {"dn1": "no heartbeat received"},
                "metrics": {"namenode": {"liveUnits": 0, "state": "active"}}}"#,
        )
        .unwrap();
        let ctx = GlobalContext::from_snapshot(snapshot);
        assert_eq!(ctx.metrics()["namenode"]["state"], MetricValue::Text("active".into()));
        assert_eq!(ctx.cluster_state().health, ClusterHealth::NoLiveUnits);
    }

    #[test]
    fn test_tail_chars_keeps_recent_content() {
        let text = "old line\nnew line";
        assert_eq!(tail_chars(text, 100), text);
        let cut = tail_chars(text, 8);
        assert!(cut.ends_with("new line"));
        assert!(!cut.contains("old"));
        assert!(cut.contains("9"));
    }

    #[test]
    fn test_from_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("datanode1.log"),
            "2024-05-01 10:00:00,000 INFO started\n2024-05-01 10:00:05,000 ERROR Connection refused",
        )
        .unwrap();
        std::fs::write(dir.path().join("readme.txt"), "ignored").unwrap();
        let ctx = GlobalContext::from_log_dir(dir.path(), 50).unwrap();
        assert_eq!(ctx.logs().len(), 1);
        assert!(ctx.logs()["datanode1"].contains("Connection refused"));
        assert!(!ctx.logs()["datanode1"].contains("started"));
    }

    #[test]
    fn test_blocks_are_bounded() {
        let ctx = GlobalContext::builder()
            .log("dn1", "x".repeat(5000))
            .metric("nn", "k", "v".repeat(5000).as_str())
            .build();
        for (_, body) in ctx.log_blocks(100).iter().chain(ctx.metric_blocks(100).iter()) {
            assert!(body.chars().count() < 140);
        }
    }
}
