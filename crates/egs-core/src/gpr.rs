//! GPU request (GPR) type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ErrorKind, GprDuration};

/// Globally unique GPR identifier, assigned on admission
pub type GprId = Uuid;

/// How GPU shape and cluster are chosen for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionMode {
    AutoGpuAutoCluster,
    AutoGpuManualCluster,
    ManualGpuAutoCluster,
    ManualGpuManualCluster,
}

impl SelectionMode {
    pub fn from_constraints(manual_gpu: bool, manual_cluster: bool) -> Self {
        match (manual_gpu, manual_cluster) {
            (false, false) => SelectionMode::AutoGpuAutoCluster,
            (false, true) => SelectionMode::AutoGpuManualCluster,
            (true, false) => SelectionMode::ManualGpuAutoCluster,
            (true, true) => SelectionMode::ManualGpuManualCluster,
        }
    }

    pub fn manual_cluster(&self) -> bool {
        matches!(
            self,
            SelectionMode::AutoGpuManualCluster | SelectionMode::ManualGpuManualCluster
        )
    }
}

/// GPR lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GprState {
    /// Waiting in the admission queue
    Queued,
    /// Capacity reserved, workload not yet confirmed active
    Provisioning,
    /// Workload attached and active
    Running,
    /// Released or exit duration expired
    Complete,
    /// Provisioning or runtime failure
    Failed,
    /// Reclaimed after the idle timeout
    IdleEvicted,
    /// Cancelled before it started running
    Cancelled,
}

impl GprState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GprState::Complete | GprState::Failed | GprState::IdleEvicted | GprState::Cancelled
        )
    }
}

impl std::fmt::Display for GprState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GprState::Queued => write!(f, "Queued"),
            GprState::Provisioning => write!(f, "Provisioning"),
            GprState::Running => write!(f, "Running"),
            GprState::Complete => write!(f, "Complete"),
            GprState::Failed => write!(f, "Failed"),
            GprState::IdleEvicted => write!(f, "IdleEvicted"),
            GprState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Caller-supplied request to create a GPR.
///
/// Unset fields are filled from the resolved template when auto-GPR is enabled
/// for the workspace; explicit fields always win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGprRequest {
    pub request_name: String,
    pub workspace_name: String,
    /// Preferred clusters, evaluated in order. Empty means any cluster.
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub node_count: Option<u32>,
    #[serde(default)]
    pub gpu_per_node_count: Option<u32>,
    /// Memory per GPU in GB
    #[serde(default)]
    pub memory_per_gpu: Option<u32>,
    #[serde(default)]
    pub gpu_shape: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub exit_duration: Option<GprDuration>,
    #[serde(default)]
    pub priority: Option<u32>,
    /// Explicit template; the only way to use templates when auto-GPR is off
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub enforce_idle_timeout: Option<bool>,
    #[serde(default)]
    pub idle_timeout_duration: Option<GprDuration>,
    #[serde(default)]
    pub enable_eviction: Option<bool>,
    #[serde(default)]
    pub requeue_on_failure: Option<bool>,
}

/// A normalized GPU request owned by the lifecycle state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuRequest {
    pub id: GprId,
    pub request_name: String,
    pub workspace_name: String,
    pub priority: u32,
    pub memory_per_gpu: u32,
    pub exit_duration: GprDuration,
    pub node_count: u32,
    pub gpu_per_node_count: u32,
    pub selection: SelectionMode,
    pub cluster_constraint: Vec<String>,
    pub gpu_shape_constraint: Option<String>,
    pub instance_type_constraint: Option<String>,
    pub state: GprState,
    pub created_at: DateTime<Utc>,
    pub enforce_idle_timeout: bool,
    pub idle_timeout_duration: Option<GprDuration>,
    pub enable_eviction: bool,
    pub requeue_on_failure: bool,
    /// Template the defaults came from, if any
    pub template_name: Option<String>,
}

impl GpuRequest {
    /// GPUs needed across all nodes, saturating at `u32::MAX`
    pub fn total_gpus(&self) -> u32 {
        self.node_count.saturating_mul(self.gpu_per_node_count)
    }
}

/// GPUs reserved on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAllocation {
    pub node_name: String,
    pub gpu_count: u32,
}

/// The concrete capacity a GPR holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub cluster_name: String,
    pub gpu_shape: String,
    pub instance_type: String,
    pub nodes: Vec<NodeAllocation>,
}

impl Placement {
    pub fn total_gpus(&self) -> u32 {
        self.nodes.iter().map(|n| n.gpu_count).sum()
    }
}

/// Why a GPR failed, with the originating error kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub reason: String,
}

/// Read-only view of a GPR returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GprSnapshot {
    pub id: GprId,
    pub request_name: String,
    pub workspace_name: String,
    pub state: GprState,
    pub selection: SelectionMode,
    pub cluster: Option<String>,
    pub node: Option<String>,
    pub nodes: Vec<String>,
    pub gpu_shape: Option<String>,
    pub instance_type: Option<String>,
    pub priority: u32,
    pub num_gpus_allocated: u32,
    pub exit_duration: GprDuration,
    pub created_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub requeue_count: u32,
    pub failure: Option<FailureInfo>,
    pub last_error: Option<FailureInfo>,
}

/// Outcome of `release_gpr`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    /// GPR had not started running and was cancelled
    Cancelled,
    /// Running GPR was released and its capacity returned
    Released,
    /// GPR was already in a terminal state; nothing changed
    AlreadyCompleted,
}

/// Workload status reported by the orchestration layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkloadSignal {
    /// Workload attached to the GPR is active
    Active,
    /// Workload reports no activity
    Idle,
    /// Workload failed to provision or crashed
    Failed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_mode_from_constraints() {
        assert_eq!(
            SelectionMode::from_constraints(false, false),
            SelectionMode::AutoGpuAutoCluster
        );
        assert_eq!(
            SelectionMode::from_constraints(true, true),
            SelectionMode::ManualGpuManualCluster
        );
        assert!(SelectionMode::AutoGpuManualCluster.manual_cluster());
    }

    #[test]
    fn test_terminal_states() {
        assert!(GprState::Complete.is_terminal());
        assert!(GprState::Cancelled.is_terminal());
        assert!(!GprState::Queued.is_terminal());
    }

    #[test]
    fn test_create_request_parse() {
        let json = r#"{
            "requestName": "train-1",
            "workspaceName": "team-a",
            "clusters": ["worker-1"],
            "nodeCount": 1,
            "gpuPerNodeCount": 2,
            "gpuShape": "A100",
            "exitDuration": "1h",
            "priority": 150
        }"#;
        let req: CreateGprRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.clusters, vec!["worker-1".to_string()]);
        assert_eq!(req.exit_duration.unwrap().as_std().as_secs(), 3600);
        assert!(req.instance_type.is_none());
    }

    #[test]
    fn test_workload_signal_parse() {
        let signal: WorkloadSignal =
            serde_json::from_str(r#"{"type":"failed","reason":"oom"}"#).unwrap();
        assert_eq!(
            signal,
            WorkloadSignal::Failed {
                reason: "oom".to_string()
            }
        );
    }
}
