//! Duplicate reconciliation controllers
//!
//! One generic engine drives the per-suffix state machine; kind adapters
//! supply Deployment- and VPA-specific construction, staleness policy, and
//! cluster access. Membership of the duplicate working set is decided by
//! annotation presence alone, never by label selectors.

pub mod deployment;
pub mod engine;
pub mod template_watch;
pub mod vpa;

/// Marks a Deployment as a duplicate and carries its suffix.
pub const DEPLOYMENT_ID_ANNOTATION: &str = "kubernetes-database-scaler/deployment-id";

/// Template generation observed when a Deployment duplicate was created.
pub const ORIGINAL_OBSERVED_GENERATION_ANNOTATION: &str =
    "kubernetes-database-scaler/original-observed-generation";

/// Marks a VerticalPodAutoscaler as a duplicate and carries its suffix.
pub const VPA_ID_ANNOTATION: &str = "kubernetes-database-scaler/vpa-id";

pub use deployment::{DeploymentAdapter, DeploymentStore, KubeDeploymentStore};
pub use engine::{DuplicateEngine, KindAdapter};
pub use vpa::{KubeVpaStore, VpaAdapter, VpaStore};

/// Engine wired for Deployment duplication against the cluster.
pub type DeploymentEngine = DuplicateEngine<DeploymentAdapter<KubeDeploymentStore>>;

/// Engine wired for VPA duplication against the cluster.
pub type VpaEngine = DuplicateEngine<VpaAdapter<KubeVpaStore>>;
