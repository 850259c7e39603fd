//! 专家选择器
//!
//! 纯确定性映射：主故障类型的归属专家在前，其次是分类表为它登记的联动专家，再按相关类型各追加归属专家，
//! 去重保序后截断到 max_experts；没有任何映射时退回通用专家并打上 fallback 标记。

use std::sync::Arc;

use crate::diagnosis::{
    ClassificationResult, ClusterState, ExpertRole, ExpertSelection, FaultTaxonomy,
};

pub struct ExpertSelector {
    taxonomy: Arc<FaultTaxonomy>,
    max_experts: usize,
}

impl ExpertSelector {
    pub fn new(taxonomy: Arc<FaultTaxonomy>, max_experts: usize) -> Self {
        Self {
            taxonomy,
            max_experts: max_experts.max(1),
        }
    }

    /// 把分类表按集群状态推出的伴随故障并入相关类型（去重，排除主故障）
    pub fn expand_related(&self, classification: &mut ClassificationResult, cluster: &ClusterState) {
        let primary = &classification.primary_fault_type;
        for implied in self.taxonomy.implied_by(primary, cluster) {
            if &implied != primary && !classification.related_fault_types.contains(&implied) {
                tracing::debug!(primary = %primary, implied = %implied, "adding implied fault");
                classification.related_fault_types.push(implied);
            }
        }
    }

    pub fn select(&self, classification: &ClassificationResult) -> ExpertSelection {
        let primary = &classification.primary_fault_type;
        let owners = self
            .taxonomy
            .owner_of(primary)
            .into_iter()
            .chain(self.taxonomy.related_experts_of(primary).iter().copied());
        let related_owners = classification
            .related_fault_types
            .iter()
            .filter_map(|fault| self.taxonomy.owner_of(fault));

        let mut roles: Vec<ExpertRole> = Vec::new();
        for role in owners.chain(related_owners) {
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        roles.truncate(self.max_experts);

        if roles.is_empty() {
            tracing::warn!(
                fault_type = %classification.primary_fault_type,
                "no specialist owns the classified fault, falling back to generalist"
            );
            return ExpertSelection {
                roles: vec![ExpertRole::GENERALIST],
                fallback: true,
            };
        }

        tracing::info!(roles = ?roles, "experts selected");
        ExpertSelection {
            roles,
            fallback: false,
        }
    }
}
