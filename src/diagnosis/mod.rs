//! 诊断流水线：分类 -> 专家选择 -> 专家并发诊断 -> 讨论合成

pub mod classifier;
pub mod context;
pub mod discussion;
pub mod events;
pub mod expert;
pub mod format;
pub mod parse;
pub mod roles;
pub mod selector;
pub mod taxonomy;
pub mod types;

pub use classifier::{ClassifierConfig, FaultClassifier, CLASSIFIER_ROLE};
pub use context::{
    tail_chars, ClusterHealth, ClusterState, ContextSnapshot, GlobalContext, GlobalContextBuilder,
    MetricBundle, MetricValue,
};
pub use discussion::{DiscussionConfig, DiscussionSynthesizer, MODERATOR_ROLE};
pub use events::{DiagnosisEvent, EventSender};
pub use expert::{ExpertAgent, ExpertConfig, ExpertDeps};
pub use format::render_markdown;
pub use roles::{ExpertRole, RoleSpec};
pub use selector::ExpertSelector;
pub use taxonomy::{FaultEntry, FaultTaxonomy, FaultType, Severity};
pub use types::{
    ClassificationResult, Conflict, DiagnosisOutcome, DiagnosisReport, DiagnosisStatus,
    ExpertDiagnosis, ExpertSelection, ExpertSummary, FaultCandidate, OverallStatus, ToolCallRecord,
    ToolOutcome,
};
