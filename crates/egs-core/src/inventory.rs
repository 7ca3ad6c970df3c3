//! Cluster and node GPU inventory

use serde::{Deserialize, Serialize};

/// A GPU-bearing node as tracked by the inventory index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node name, unique within its cluster
    pub name: String,
    /// Cluster the node belongs to
    pub cluster_name: String,
    /// GPU shape (e.g., "A100")
    pub gpu_shape: String,
    /// Instance type (e.g., "a2-highgpu-2g")
    pub instance_type: String,
    /// Memory per GPU in GB
    #[serde(rename = "memoryPerGpuGB")]
    pub memory_per_gpu_gb: u32,
    /// Total GPUs on the node
    pub total_gpu_count: u32,
    /// GPUs not currently reserved
    pub available_gpu_count: u32,
    /// Scheduling status
    pub status: NodeStatus,
}

impl Node {
    /// Normalize a raw feed record into a node
    pub fn from_raw(raw: &RawInventoryItem) -> Self {
        let total = raw.gpu_count;
        let available = raw.available_gpu_count.unwrap_or(total).min(total);
        let memory_per_gpu_gb = if total > 0 { raw.memory / total } else { 0 };

        Self {
            name: raw.gpu_node_name.clone(),
            cluster_name: raw.cluster_name.clone(),
            gpu_shape: raw.gpu_shape.clone(),
            instance_type: raw.instance_type.clone(),
            memory_per_gpu_gb,
            total_gpu_count: total,
            available_gpu_count: available,
            status: NodeStatus::from_raw(&raw.node_health, &raw.gpu_node_status),
        }
    }

    /// GPUs currently reserved on this node
    pub fn used_gpu_count(&self) -> u32 {
        self.total_gpu_count - self.available_gpu_count
    }

    pub fn is_schedulable(&self) -> bool {
        self.status == NodeStatus::Ready
    }
}

/// Node scheduling status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Healthy and accepting reservations
    Ready,
    /// Unhealthy or reported unavailable by the feed
    NotReady,
    /// Administratively excluded from scheduling
    Cordoned,
    /// Dropped from the latest feed snapshot while still holding reservations
    Gone,
}

impl NodeStatus {
    fn from_raw(health: &str, status: &str) -> Self {
        if status.eq_ignore_ascii_case("cordoned") {
            return NodeStatus::Cordoned;
        }
        if !health.eq_ignore_ascii_case("healthy") || status.eq_ignore_ascii_case("unavailable") {
            return NodeStatus::NotReady;
        }
        NodeStatus::Ready
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Ready => write!(f, "Ready"),
            NodeStatus::NotReady => write!(f, "NotReady"),
            NodeStatus::Cordoned => write!(f, "Cordoned"),
            NodeStatus::Gone => write!(f, "Gone"),
        }
    }
}

/// A cluster and its GPU nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Cluster {
    pub fn total_gpus(&self) -> u32 {
        self.nodes.iter().map(|n| n.total_gpu_count).sum()
    }

    pub fn available_gpus(&self) -> u32 {
        self.nodes
            .iter()
            .filter(|n| n.is_schedulable())
            .map(|n| n.available_gpu_count)
            .sum()
    }

    /// Whether any schedulable node of this shape has a free GPU
    pub fn has_capacity_for_shape(&self, gpu_shape: &str) -> bool {
        self.nodes
            .iter()
            .any(|n| n.is_schedulable() && n.gpu_shape == gpu_shape && n.available_gpu_count > 0)
    }
}

/// Raw per-node record as delivered by the inventory feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInventoryItem {
    pub gpu_node_name: String,
    pub cluster_name: String,
    pub gpu_shape: String,
    #[serde(default)]
    pub gpu_model_name: String,
    pub instance_type: String,
    /// Node GPU memory in GB
    pub memory: u32,
    pub gpu_count: u32,
    /// Free GPUs as seen by the feed; defaults to `gpu_count`
    #[serde(default)]
    pub available_gpu_count: Option<u32>,
    #[serde(default = "default_health")]
    pub node_health: String,
    #[serde(default)]
    pub gpu_node_status: String,
    #[serde(default)]
    pub cloud_provider: String,
    #[serde(default)]
    pub region: String,
}

fn default_health() -> String {
    "Healthy".to_string()
}

/// Event delivered by the inventory feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InventoryEvent {
    /// Full snapshot of one cluster's GPU nodes
    #[serde(rename_all = "camelCase")]
    Snapshot {
        cluster_name: String,
        items: Vec<RawInventoryItem>,
    },
    /// Cluster is no longer reported by the feed
    #[serde(rename_all = "camelCase")]
    ClusterRemoved { cluster_name: String },
}

/// Workspace capacity usage for one (cluster, shape, instance type) group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryUsage {
    pub cluster_name: String,
    pub node_names: Vec<String>,
    pub gpu_shape: String,
    pub instance_type: String,
    pub memory_per_gpu_gb: u32,
    pub total_gpus: u32,
    pub available_gpus: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, count: u32, health: &str, status: &str) -> RawInventoryItem {
        RawInventoryItem {
            gpu_node_name: name.to_string(),
            cluster_name: "worker-1".to_string(),
            gpu_shape: "A100".to_string(),
            gpu_model_name: "NVIDIA A100-SXM4-40GB".to_string(),
            instance_type: "a2-highgpu-2g".to_string(),
            memory: 80,
            gpu_count: count,
            available_gpu_count: None,
            node_health: health.to_string(),
            gpu_node_status: status.to_string(),
            cloud_provider: "gcp".to_string(),
            region: "us-central1".to_string(),
        }
    }

    #[test]
    fn test_node_from_raw() {
        let node = Node::from_raw(&raw("gpu-node-0", 2, "Healthy", "Available"));
        assert_eq!(node.memory_per_gpu_gb, 40);
        assert_eq!(node.total_gpu_count, 2);
        assert_eq!(node.available_gpu_count, 2);
        assert_eq!(node.status, NodeStatus::Ready);
    }

    #[test]
    fn test_node_status_mapping() {
        assert_eq!(
            Node::from_raw(&raw("n", 1, "Unhealthy", "")).status,
            NodeStatus::NotReady
        );
        assert_eq!(
            Node::from_raw(&raw("n", 1, "Healthy", "Cordoned")).status,
            NodeStatus::Cordoned
        );
    }

    #[test]
    fn test_available_capped_by_total() {
        let mut item = raw("n", 2, "Healthy", "");
        item.available_gpu_count = Some(5);
        assert_eq!(Node::from_raw(&item).available_gpu_count, 2);
    }

    #[test]
    fn test_inventory_event_parse() {
        let json = r#"{"type":"clusterRemoved","clusterName":"worker-2"}"#;
        let event: InventoryEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, InventoryEvent::ClusterRemoved { cluster_name } if cluster_name == "worker-2"));
    }
}
