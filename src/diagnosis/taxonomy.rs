//! 故障分类表
//!
//! 封闭集合，外部以 TOML 维护（内置表即 config/taxonomy.toml）。`FaultType` 只能经由分类表解析得到，
//! 从而保证分类结果与专家诊断中的故障类型都落在同一张表内。

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::DiagnosisError;
use crate::diagnosis::context::{ClusterHealth, ClusterState};
use crate::diagnosis::roles::ExpertRole;

const BUILTIN_TAXONOMY: &str = include_str!("../../config/taxonomy.toml");

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FaultType(String);

impl FaultType {
    pub const UNKNOWN: &'static str = "unknown";

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FaultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FaultEntry {
    pub id: String,
    pub owner: ExpertRole,
    pub category: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub remediation: Vec<String>,
    /// 归属专家之外总是一并请来的专家（联动排查）
    #[serde(default)]
    pub related_experts: Vec<ExpertRole>,
    #[serde(default)]
    pub implies: Vec<ImpliedFault>,
}

/// 主故障出现时可能伴随的故障；`when` 为空表示无条件
#[derive(Clone, Debug, Deserialize)]
pub struct ImpliedFault {
    pub fault: String,
    #[serde(default)]
    pub when: Option<ClusterHealth>,
}

impl ImpliedFault {
    fn applies(&self, cluster: &ClusterState) -> bool {
        self.when.map_or(true, |health| cluster.health == health)
    }
}

#[derive(Deserialize)]
struct TaxonomyFile {
    #[serde(default)]
    fault: Vec<FaultEntry>,
}

#[derive(Clone, Debug)]
pub struct FaultTaxonomy {
    entries: Vec<FaultEntry>,
    index: HashMap<String, usize>,
}

fn normalize(name: &str) -> String {
    name.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .to_lowercase()
        .replace(['-', ' '], "_")
}

impl FaultTaxonomy {
    /// 内置分类表（HDFS / YARN / MapReduce / 网络）
    pub fn builtin() -> Self {
        match Self::from_toml_str(BUILTIN_TAXONOMY) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Builtin taxonomy invalid ({}), using empty taxonomy", e);
                Self {
                    entries: Vec::new(),
                    index: HashMap::new(),
                }
            }
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, DiagnosisError> {
        let file: TaxonomyFile = toml::from_str(content)
            .map_err(|e| DiagnosisError::Config(format!("taxonomy: {e}")))?;
        if file.fault.is_empty() {
            return Err(DiagnosisError::Config("taxonomy has no fault entries".into()));
        }
        let mut entries = Vec::with_capacity(file.fault.len());
        let mut index = HashMap::new();
        for mut entry in file.fault {
            entry.id = normalize(&entry.id);
            if entry.id.is_empty() || entry.id == FaultType::UNKNOWN {
                return Err(DiagnosisError::Config(format!(
                    "taxonomy id '{}' is reserved or empty",
                    entry.id
                )));
            }
            if index.insert(entry.id.clone(), entries.len()).is_some() {
                return Err(DiagnosisError::Config(format!(
                    "duplicate taxonomy id '{}'",
                    entry.id
                )));
            }
            entries.push(entry);
        }
        for entry in &mut entries {
            for implied in &mut entry.implies {
                implied.fault = normalize(&implied.fault);
                if !index.contains_key(&implied.fault) {
                    return Err(DiagnosisError::Config(format!(
                        "taxonomy id '{}' implies unknown fault '{}'",
                        entry.id, implied.fault
                    )));
                }
            }
        }
        Ok(Self { entries, index })
    }

    pub fn load(path: &Path) -> Result<Self, DiagnosisError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DiagnosisError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// 名称解析：大小写、连字符、空格不敏感；"unknown" 合法；表外名称返回 None
    pub fn resolve(&self, name: &str) -> Option<FaultType> {
        let key = normalize(name);
        if key == FaultType::UNKNOWN {
            return Some(FaultType::unknown());
        }
        self.index.get(&key).map(|_| FaultType(key))
    }

    pub fn entry(&self, fault: &FaultType) -> Option<&FaultEntry> {
        self.index.get(fault.as_str()).map(|&i| &self.entries[i])
    }

    pub fn owner_of(&self, fault: &FaultType) -> Option<ExpertRole> {
        self.entry(fault).map(|e| e.owner)
    }

    pub fn related_experts_of(&self, fault: &FaultType) -> &[ExpertRole] {
        self.entry(fault).map_or(&[], |e| e.related_experts.as_slice())
    }

    /// 按集群状态推出的伴随故障（不含主故障本身）
    pub fn implied_by(&self, fault: &FaultType, cluster: &ClusterState) -> Vec<FaultType> {
        self.entry(fault)
            .map(|e| {
                e.implies
                    .iter()
                    .filter(|i| i.applies(cluster) && i.fault != fault.as_str())
                    .map(|i| FaultType(i.fault.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remediation_for(&self, fault: &FaultType) -> Vec<String> {
        self.entry(fault).map(|e| e.remediation.clone()).unwrap_or_default()
    }

    pub fn entries(&self) -> &[FaultEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 自由文本中最先出现的分类 id（用于从叙述型回答中提取故障类型）
    pub fn find_mentioned(&self, text: &str) -> Option<FaultType> {
        let lower = text.to_lowercase();
        self.entries
            .iter()
            .filter_map(|e| lower.find(&e.id).map(|pos| (pos, &e.id)))
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, id)| FaultType(id.clone()))
    }

    /// 供 prompt 使用的分类表清单
    pub fn render_for_prompt(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                let mut line = format!("- {} [{}]: {}", e.id, e.category, e.description);
                if !e.keywords.is_empty() {
                    line.push_str(&format!("（线索: {}）", e.keywords.join(", ")));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for FaultTaxonomy {
    fn default() -> Self {
        Self::builtin()
    }
}
