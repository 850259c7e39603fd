//! 专家角色表
//!
//! 角色是封闭枚举，每个角色在静态表中绑定人设、知识领域与工具白名单；
//! 按角色构造专家 Agent 走这张表，不做运行时按名反射。

use serde::{Deserialize, Serialize};

use crate::tools::{TOOL_ERROR_SUMMARY, TOOL_GET_METRICS, TOOL_NODE_LOG, TOOL_SEARCH_KNOWLEDGE, TOOL_SEARCH_LOGS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExpertRole {
    /// 存储节点（HDFS NameNode / DataNode）专家
    #[serde(rename = "hdfs_expert")]
    Hdfs,
    #[serde(rename = "yarn_expert")]
    Yarn,
    #[serde(rename = "mapreduce_expert")]
    MapReduce,
    #[serde(rename = "network_expert")]
    Network,
    /// 通用专家，分类无法落到任何专科时兜底
    #[serde(rename = "generic_expert")]
    Generic,
}

pub struct RoleSpec {
    pub role: ExpertRole,
    pub display_name: &'static str,
    pub persona: &'static str,
    /// 第一个为主领域
    pub knowledge_domains: &'static [&'static str],
    /// 空表示可使用全部已注册工具
    pub tools: &'static [&'static str],
}

const HDFS_TOOLS: &[&str] = &[TOOL_NODE_LOG, TOOL_SEARCH_LOGS, TOOL_ERROR_SUMMARY, TOOL_GET_METRICS, TOOL_SEARCH_KNOWLEDGE];
const YARN_TOOLS: &[&str] = &[TOOL_NODE_LOG, TOOL_SEARCH_LOGS, TOOL_GET_METRICS, TOOL_SEARCH_KNOWLEDGE];
const NETWORK_TOOLS: &[&str] = &[TOOL_NODE_LOG, TOOL_SEARCH_LOGS, TOOL_GET_METRICS, TOOL_SEARCH_KNOWLEDGE];

static ROLE_SPECS: [RoleSpec; 5] = [
    RoleSpec {
        role: ExpertRole::Hdfs,
        display_name: "HDFS 专家",
        persona: "你是 HDFS 存储层故障诊断专家，熟悉 NameNode 元数据管理、DataNode 心跳与块汇报、副本放置、安全模式与 clusterID 一致性。",
        knowledge_domains: &["DataNodeExpert", "NameNodeExpert", "HistoryCases"],
        tools: HDFS_TOOLS,
    },
    RoleSpec {
        role: ExpertRole::Yarn,
        display_name: "YARN 专家",
        persona: "你是 YARN 资源调度故障诊断专家，熟悉 ResourceManager / NodeManager 生命周期、队列与容量调度、yarn-site.xml 配置。",
        knowledge_domains: &["YARNExpert", "HistoryCases"],
        tools: YARN_TOOLS,
    },
    RoleSpec {
        role: ExpertRole::MapReduce,
        display_name: "MapReduce 专家",
        persona: "你是 MapReduce 作业故障诊断专家，熟悉 Map/Reduce 任务内存与磁盘需求、Shuffle、任务超时与重试。",
        knowledge_domains: &["MapReduceExpert", "HistoryCases"],
        tools: YARN_TOOLS,
    },
    RoleSpec {
        role: ExpertRole::Network,
        display_name: "网络专家",
        persona: "你是集群网络故障诊断专家，熟悉节点间连通性、端口与防火墙、DNS 解析、RPC 超时与网络分区。",
        knowledge_domains: &["NetworkExpert", "HistoryCases"],
        tools: NETWORK_TOOLS,
    },
    RoleSpec {
        role: ExpertRole::Generic,
        display_name: "通用专家",
        persona: "你是 Hadoop 集群通用故障诊断专家，覆盖 HDFS、YARN、MapReduce 与网络，在故障类型不明确时做全面排查。",
        knowledge_domains: &["HistoryCases", "NameNodeExpert", "DataNodeExpert", "YARNExpert"],
        tools: &[],
    },
];

impl ExpertRole {
    pub const ALL: [ExpertRole; 5] = [
        ExpertRole::Hdfs,
        ExpertRole::Yarn,
        ExpertRole::MapReduce,
        ExpertRole::Network,
        ExpertRole::Generic,
    ];

    pub const GENERALIST: ExpertRole = ExpertRole::Generic;

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpertRole::Hdfs => "hdfs_expert",
            ExpertRole::Yarn => "yarn_expert",
            ExpertRole::MapReduce => "mapreduce_expert",
            ExpertRole::Network => "network_expert",
            ExpertRole::Generic => "generic_expert",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == name || r.as_str().trim_end_matches("_expert") == name)
    }

    pub fn spec(&self) -> &'static RoleSpec {
        let idx = Self::ALL.iter().position(|r| r == self).unwrap_or(ROLE_SPECS.len() - 1);
        &ROLE_SPECS[idx]
    }
}

impl std::fmt::Display for ExpertRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
