//! 推理输出解析
//!
//! 专家回复要么是工具请求 `{"action":"call_tool","tool":..,"args":{..}}`，要么是最终诊断 JSON；
//! 都不是时按自由文本处理，用正则提取根因、置信度、证据与编号修复步骤。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::DiagnosisError;

const MAX_EVIDENCE: usize = 5;
const MAX_STEPS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub tool: String,
    /// 原样传给工具的参数文本（通常是 JSON 对象）
    pub args: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDiagnosis {
    /// 未经分类表校验的原始名称
    pub fault_type: Option<String>,
    pub confidence: Option<f32>,
    pub root_cause: String,
    pub evidence: Vec<String>,
    pub remediation: Vec<String>,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpertDecision {
    CallTool(ToolRequest),
    Final(ParsedDiagnosis),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawClassification {
    pub fault_type: String,
    pub confidence: f32,
    pub related: Vec<String>,
    pub reasoning: String,
}

/// 提取 JSON 片段：优先 ```json 代码块，其次首个 `{` 到末个 `}`
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str(extract_json(text)?) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// 百分数（>1）按 /100 处理，最终截断到 [0, 1]
pub fn normalize_confidence(v: f64) -> f32 {
    if !v.is_finite() {
        return 0.0;
    }
    let v = if v > 1.0 { v / 100.0 } else { v };
    v.clamp(0.0, 1.0) as f32
}

fn confidence_field(v: &Value) -> Option<f32> {
    match v {
        Value::Number(n) => n.as_f64().map(normalize_confidence),
        Value::String(s) => s
            .trim()
            .trim_end_matches('%')
            .parse::<f64>()
            .ok()
            .map(normalize_confidence),
        _ => None,
    }
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| match i {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn first_str<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// 解析专家回复；空输出返回 None
pub fn parse_decision(output: &str) -> Option<ExpertDecision> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Some(map) = parse_object(trimmed) else {
        return Some(ExpertDecision::Final(parse_narrative(trimmed)));
    };

    let action = first_str(&map, &["action"]).unwrap_or("");
    let tool = first_str(&map, &["tool", "tool_name"]);
    if let Some(tool) = tool {
        if action.is_empty() || action == "call_tool" {
            let args = match map.get("args").or_else(|| map.get("arguments")) {
                None | Some(Value::Null) => "{}".to_string(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            return Some(ExpertDecision::CallTool(ToolRequest {
                tool: tool.to_string(),
                args,
            }));
        }
    }

    let root_cause = first_str(&map, &["root_cause", "diagnosis", "summary", "reasoning"])
        .unwrap_or("")
        .to_string();
    let mut evidence = string_list(map.get("evidence"));
    evidence.truncate(MAX_EVIDENCE);
    let mut remediation = string_list(
        map.get("remediation")
            .or_else(|| map.get("fix_steps"))
            .or_else(|| map.get("steps")),
    );
    remediation.truncate(MAX_STEPS);

    Some(ExpertDecision::Final(ParsedDiagnosis {
        fault_type: first_str(&map, &["fault_type"]).map(String::from),
        confidence: map.get("confidence").and_then(confidence_field),
        root_cause,
        evidence,
        remediation,
        raw: trimmed.to_string(),
    }))
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn root_cause_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?im)(?:根本原因|根因|root\s*cause)\s*(?:\*\*)?\s*[:：]\s*(?:\*\*)?\s*(.+)$")
}

fn confidence_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?i)(?:置信度|confidence)\s*(?:\*\*)?\s*[:：]?\s*(?:\*\*)?\s*(\d+(?:\.\d+)?)\s*(%)?")
}

fn evidence_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?im)^\s*[-*•]?\s*(?:证据|evidence)\s*\d*\s*[:：]\s*(.+)$")
}

fn step_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&RE, r"(?m)^\s*\d+\s*[.)、]\s+(.+)$")
}

/// 自由文本回答的提取
pub fn parse_narrative(text: &str) -> ParsedDiagnosis {
    let root_cause = root_cause_re()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| {
            text.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("")
                .to_string()
        });

    let confidence = confidence_re()
        .and_then(|re| re.captures(text))
        .and_then(|c| {
            let v: f64 = c.get(1)?.as_str().parse().ok()?;
            Some(if c.get(2).is_some() { normalize_confidence(v / 100.0) } else { normalize_confidence(v) })
        });

    let evidence = evidence_re()
        .map(|re| {
            re.captures_iter(text)
                .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
                .take(MAX_EVIDENCE)
                .collect()
        })
        .unwrap_or_default();

    let remediation = step_re()
        .map(|re| {
            re.captures_iter(text)
                .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
                .take(MAX_STEPS)
                .collect()
        })
        .unwrap_or_default();

    ParsedDiagnosis {
        fault_type: None,
        confidence,
        root_cause,
        evidence,
        remediation,
        raw: text.to_string(),
    }
}

/// 分类器输出解析：必须是含 fault_type 与 confidence 的 JSON 对象
pub fn parse_classification(output: &str) -> Result<RawClassification, DiagnosisError> {
    let map = parse_object(output).ok_or_else(|| {
        DiagnosisError::Classification(format!("no JSON object in output: {}", preview(output)))
    })?;
    let fault_type = first_str(&map, &["fault_type", "primary_fault_type"])
        .ok_or_else(|| DiagnosisError::Classification("missing field fault_type".into()))?
        .to_string();
    let confidence = map
        .get("confidence")
        .and_then(confidence_field)
        .ok_or_else(|| DiagnosisError::Classification("missing or non-numeric confidence".into()))?;
    let related = string_list(
        map.get("related_faults")
            .or_else(|| map.get("related_fault_types")),
    );
    let reasoning = first_str(&map, &["reasoning", "rationale"]).unwrap_or("").to_string();
    Ok(RawClassification {
        fault_type,
        confidence,
        related,
        reasoning,
    })
}

fn preview(text: &str) -> String {
    let t = text.trim();
    if t.chars().count() > 120 {
        format!("{}...", t.chars().take(120).collect::<String>())
    } else {
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_request() {
        let out = r#"先看指标。{"action": "call_tool", "tool": "get_metrics", "args": {"component": "namenode"}}"#;
        match parse_decision(out) {
            Some(ExpertDecision::CallTool(req)) => {
                assert_eq!(req.tool, "get_metrics");
                assert_eq!(req.args, r#"{"component":"namenode"}"#);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tool_request_without_action_and_args() {
        let out = "```json\n{\"tool\": \"search_logs\"}\n```";
        assert_eq!(
            parse_decision(out),
            Some(ExpertDecision::CallTool(ToolRequest {
                tool: "search_logs".into(),
                args: "{}".into()
            }))
        );
    }

    #[test]
    fn test_final_json() {
        let out = r#"{"action": "final", "fault_type": "datanode_down", "confidence": 90,
            "root_cause": "DataNode 进程已停止", "evidence": ["0 live units", "JMX unreachable"],
            "fix_steps": ["重启 DataNode"]}"#;
        match parse_decision(out) {
            Some(ExpertDecision::Final(d)) => {
                assert_eq!(d.fault_type.as_deref(), Some("datanode_down"));
                assert_eq!(d.confidence, Some(0.9));
                assert_eq!(d.evidence.len(), 2);
                assert_eq!(d.remediation, vec!["重启 DataNode".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_narrative_extraction() {
        let text = "分析如下\n根本原因：DataNode 心跳丢失\n证据: no heartbeat received\n置信度: 85%\n修复步骤:\n1. 检查进程\n2. 重启 DataNode\n";
        match parse_decision(text) {
            Some(ExpertDecision::Final(d)) => {
                assert_eq!(d.root_cause, "DataNode 心跳丢失");
                assert_eq!(d.confidence, Some(0.85));
                assert_eq!(d.evidence, vec!["no heartbeat received".to_string()]);
                assert_eq!(d.remediation.len(), 2);
                assert!(d.fault_type.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_output() {
        assert_eq!(parse_decision("   "), None);
    }

    #[test]
    fn test_classification_ok() {
        let raw = parse_classification(
            r#"{"fault_type":"datanode_down","confidence":"0.8","related_faults":["under_replicated_blocks"],"reasoning":"r"}"#,
        )
        .unwrap();
        assert_eq!(raw.fault_type, "datanode_down");
        assert_eq!(raw.confidence, 0.8);
        assert_eq!(raw.related, vec!["under_replicated_blocks".to_string()]);
    }

    #[test]
    fn test_classification_malformed() {
        assert!(matches!(
            parse_classification("I think it is the datanode"),
            Err(DiagnosisError::Classification(_))
        ));
        assert!(parse_classification(r#"{"fault_type":"datanode_down"}"#).is_err());
        assert!(parse_classification(r#"{"confidence":0.3}"#).is_err());
    }

    #[test]
    fn test_confidence_normalization() {
        assert_eq!(normalize_confidence(0.4), 0.4);
        assert_eq!(normalize_confidence(80.0), 0.8);
        assert_eq!(normalize_confidence(-3.0), 0.0);
        assert_eq!(normalize_confidence(f64::NAN), 0.0);
    }
}
