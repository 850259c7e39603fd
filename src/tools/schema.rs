//! 专家 / 分类器输出格式的 JSON Schema（schemars 生成）
//!
//! 拼入 system prompt，约束 LLM 只输出合法的工具请求或诊断结论。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};

/// 工具调用请求格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 固定为 "call_tool"
    action: String,
    /// 工具名，必须取自可用工具列表
    tool: String,
    /// 工具参数，如 node、component、keyword、query
    args: HashMap<String, String>,
}

/// 最终诊断格式
#[allow(dead_code)]
#[derive(JsonSchema)]
struct FinalDiagnosisFormat {
    /// 固定为 "final"
    action: String,
    /// 故障类型 id，取自故障类型列表；无法判断时为 "unknown"
    fault_type: String,
    /// 0 到 1 之间
    confidence: f32,
    root_cause: String,
    /// 支持结论的日志 / 指标 / 工具输出片段，最多 5 条
    evidence: Vec<String>,
    /// 有序修复步骤
    remediation: Vec<String>,
}

/// 分类器输出格式
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ClassificationFormat {
    fault_type: String,
    confidence: f32,
    /// 可能同时存在的其它故障类型 id
    related_faults: Vec<String>,
    reasoning: String,
}

fn to_json<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default()
}

pub fn tool_call_schema_json() -> String {
    to_json::<ToolCallFormat>()
}

pub fn final_diagnosis_schema_json() -> String {
    to_json::<FinalDiagnosisFormat>()
}

pub fn classification_schema_json() -> String {
    to_json::<ClassificationFormat>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schemas_name_required_fields() {
        let tool = tool_call_schema_json();
        assert!(tool.contains("\"tool\""));
        assert!(tool.contains("\"args\""));
        let fin = final_diagnosis_schema_json();
        assert!(fin.contains("\"fault_type\""));
        assert!(fin.contains("\"remediation\""));
        assert!(classification_schema_json().contains("\"related_faults\""));
    }
}
