//! 集群指标工具
//!
//! MetricSource 抽象指标来源：JmxMetricSource 经 HTTP 拉取各组件 /jmx 并拍平 beans 中的标量字段，
//! StaticMetricSource 用于测试与快照回放。get_metrics 工具把指标渲染为 `key = value` 文本。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::diagnosis::{MetricBundle, MetricValue};
use crate::tools::{Tool, ToolArgs, TOOL_GET_METRICS};

#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(&self, component: &str) -> Result<MetricBundle, String>;

    fn components(&self) -> Vec<String>;
}

/// JMX 指标源：component -> http://host:port/jmx
pub struct JmxMetricSource {
    client: Client,
    endpoints: BTreeMap<String, String>,
}

impl JmxMetricSource {
    pub fn new(endpoints: BTreeMap<String, String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, endpoints }
    }
}

#[async_trait]
impl MetricSource for JmxMetricSource {
    async fn fetch(&self, component: &str) -> Result<MetricBundle, String> {
        let url = self
            .endpoints
            .get(component)
            .ok_or_else(|| format!("unknown component '{}'", component))?;
        let body: Value = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("JMX unreachable ({}): {}", url, e))?
            .error_for_status()
            .map_err(|e| format!("JMX error ({}): {}", url, e))?
            .json()
            .await
            .map_err(|e| format!("JMX response not JSON ({}): {}", url, e))?;
        Ok(flatten_jmx(&body))
    }

    fn components(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }
}

/// 拍平 JMX beans：取每个 bean 的数值与短文本字段，同名字段以先出现者为准
pub fn flatten_jmx(body: &Value) -> MetricBundle {
    let mut bundle = MetricBundle::new();
    let Some(beans) = body.get("beans").and_then(|b| b.as_array()) else {
        return bundle;
    };
    for bean in beans {
        let Some(fields) = bean.as_object() else {
            continue;
        };
        for (key, value) in fields {
            if key == "name" || key == "modelerType" || bundle.contains_key(key) {
                continue;
            }
            let metric = match value {
                Value::Number(n) => n.as_f64().map(MetricValue::Number),
                Value::Bool(b) => Some(MetricValue::Text(b.to_string())),
                Value::String(s) if s.len() <= 120 => Some(MetricValue::Text(s.clone())),
                _ => None,
            };
            if let Some(metric) = metric {
                bundle.insert(key.clone(), metric);
            }
        }
    }
    bundle
}

#[derive(Debug, Clone, Default)]
pub struct StaticMetricSource {
    metrics: BTreeMap<String, MetricBundle>,
}

impl StaticMetricSource {
    pub fn new(metrics: BTreeMap<String, MetricBundle>) -> Self {
        Self { metrics }
    }

    pub fn with_metric(
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
}

#[async_trait]
impl MetricSource for StaticMetricSource {
    async fn fetch(&self, component: &str) -> Result<MetricBundle, String> {
        self.metrics
            .get(component)
            .cloned()
            .ok_or_else(|| format!("unknown component '{}'", component))
    }

    fn components(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }
}

fn render_bundle(component: &str, bundle: &MetricBundle) -> String {
    let mut out = format!("=== {} ===", component);
    for (k, v) in bundle {
        out.push_str(&format!("\n{} = {}", k, v));
    }
    out
}

/// get_metrics：读取一个或全部组件的指标
pub struct MetricsTool {
    source: Arc<dyn MetricSource>,
}

impl MetricsTool {
    pub fn new(source: Arc<dyn MetricSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for MetricsTool {
    fn name(&self) -> &str {
        TOOL_GET_METRICS
    }

    fn description(&self) -> &str {
        "Fetch JMX metrics such as live datanodes, dead datanodes, safemode, under replicated blocks. Args: {\"component\": \"optional, e.g. namenode\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "component": { "type": "string" } },
            "required": []
        })
    }

    async fn invoke(&self, args: &str) -> Result<String, String> {
        let args = ToolArgs::parse(args);
        let components = match args.get("component").or_else(|| args.get("query")) {
            Some(c) => vec![c],
            None => self.source.components(),
        };
        if components.is_empty() {
            return Err("no metric components configured".to_string());
        }
        let mut sections = Vec::new();
        let mut failures = Vec::new();
        for component in &components {
            match self.source.fetch(component).await {
                Ok(bundle) => sections.push(render_bundle(component, &bundle)),
                Err(e) => failures.push(format!("{}: {}", component, e)),
            }
        }
        if sections.is_empty() {
            return Err(failures.join("; "));
        }
        if !failures.is_empty() {
            sections.push(format!("不可用: {}", failures.join("; ")));
        }
        Ok(sections.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_jmx() {
        let body = serde_json::json!({
            "beans": [
                {"name": "Hadoop:service=NameNode,name=FSNamesystemState",
                 "NumLiveDataNodes": 2, "NumDeadDataNodes": 1, "FSState": "Operational",
                 "Nested": {"a": 1}},
                {"name": "Hadoop:service=NameNode,name=NameNodeInfo",
                 "Safemode": "", "NumLiveDataNodes": 99}
            ]
        });
        let bundle = flatten_jmx(&body);
        assert_eq!(bundle.get("NumLiveDataNodes"), Some(&MetricValue::Number(2.0)));
        assert_eq!(bundle.get("FSState"), Some(&MetricValue::from("Operational")));
        assert!(!bundle.contains_key("Nested"));
        assert!(!bundle.contains_key("name"));
        assert!(flatten_jmx(&serde_json::json!({})).is_empty());
    }

    #[tokio::test]
    async fn test_metrics_tool() {
        let source = StaticMetricSource::default()
            .with_metric("namenode", "NumLiveDataNodes", 0i64)
            .with_metric("namenode", "NumDeadDataNodes", 2i64);
        let tool = MetricsTool::new(Arc::new(source));
        let out = tool.invoke("{}").await.unwrap();
        assert!(out.contains("NumLiveDataNodes = 0"));
        assert!(out.contains("NumDeadDataNodes = 2"));
        assert!(tool.invoke(r#"{"component":"resourcemanager"}"#).await.is_err());
    }
}
