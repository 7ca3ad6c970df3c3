//! Cluster and node selection for GPU requests

use egs_core::{Cluster, EgsError, EgsResult, GpuRequest, Node, NodeAllocation, Placement};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::inventory_index::InventoryIndex;

/// Strategy for choosing nodes inside one cluster
pub trait PlacementStrategy: Send + Sync {
    /// Choose nodes for the request from a cluster view, or `None` if the
    /// cluster cannot satisfy it
    fn place(&self, gpr: &GpuRequest, cluster: &Cluster) -> Option<Placement>;
}

/// Whether the node's hardware could ever host one node's share of the
/// request, ignoring status and current reservations
pub(crate) fn node_matches(gpr: &GpuRequest, node: &Node) -> bool {
    node.total_gpu_count >= gpr.gpu_per_node_count
        && node.memory_per_gpu_gb >= gpr.memory_per_gpu
        && gpr
            .gpu_shape_constraint
            .as_deref()
            .map_or(true, |s| s == node.gpu_shape)
        && gpr
            .instance_type_constraint
            .as_deref()
            .map_or(true, |t| t == node.instance_type)
}

/// Nodes keyed by (GPU shape, instance type), in the order each key is first
/// declared. Nodes of one placement always come from a single group.
pub(crate) fn shape_groups<'a>(
    nodes: impl Iterator<Item = &'a Node>,
) -> Vec<((&'a str, &'a str), Vec<&'a Node>)> {
    let mut groups: Vec<((&str, &str), Vec<&Node>)> = Vec::new();
    for node in nodes {
        let key = (node.gpu_shape.as_str(), node.instance_type.as_str());
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(node),
            None => groups.push((key, vec![node])),
        }
    }
    groups
}

/// Picks the least-loaded eligible nodes of one shape and instance type
pub struct LeastLoadedStrategy;

impl LeastLoadedStrategy {
    fn eligible(gpr: &GpuRequest, node: &Node) -> bool {
        node.is_schedulable()
            && node.available_gpu_count >= gpr.gpu_per_node_count
            && node_matches(gpr, node)
    }
}

impl PlacementStrategy for LeastLoadedStrategy {
    fn place(&self, gpr: &GpuRequest, cluster: &Cluster) -> Option<Placement> {
        let node_count = gpr.node_count as usize;
        if node_count == 0 {
            return None;
        }

        let groups = shape_groups(cluster.nodes.iter().filter(|n| Self::eligible(gpr, n)));
        let ((gpu_shape, instance_type), mut nodes) =
            groups.into_iter().find(|(_, nodes)| nodes.len() >= node_count)?;

        nodes.sort_by_key(|n| n.used_gpu_count());
        let allocations = nodes
            .into_iter()
            .take(node_count)
            .map(|n| NodeAllocation {
                node_name: n.name.clone(),
                gpu_count: gpr.gpu_per_node_count,
            })
            .collect();

        Some(Placement {
            cluster_name: cluster.name.clone(),
            gpu_shape: gpu_shape.to_string(),
            instance_type: instance_type.to_string(),
            nodes: allocations,
        })
    }
}

/// Used share of a cluster's GPUs, in permille
fn load_permille(cluster: &Cluster) -> u64 {
    let total = cluster.total_gpus() as u64;
    if total == 0 {
        return 1000;
    }
    let used: u64 = cluster.nodes.iter().map(|n| n.used_gpu_count() as u64).sum();
    used * 1000 / total
}

/// Selects and reserves capacity for GPRs.
///
/// Multi-node reservations hold the cluster's selection lock from the
/// placement decision until every node is reserved or rolled back.
pub struct SelectionEngine {
    inventory: Arc<InventoryIndex>,
    strategy: Box<dyn PlacementStrategy>,
    cluster_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SelectionEngine {
    pub fn new(inventory: Arc<InventoryIndex>) -> Self {
        Self::with_strategy(inventory, Box::new(LeastLoadedStrategy))
    }

    pub fn with_strategy(
        inventory: Arc<InventoryIndex>,
        strategy: Box<dyn PlacementStrategy>,
    ) -> Self {
        Self {
            inventory,
            strategy,
            cluster_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn cluster_lock(&self, cluster_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.cluster_locks.lock().await;
        locks
            .entry(cluster_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Order candidate clusters for a request.
    ///
    /// Manual-cluster requests keep list order. Otherwise clusters rank by
    /// unmet priority debt, then load, then declaration order.
    async fn rank(
        &self,
        gpr: &GpuRequest,
        candidates: &[String],
        debt: &HashMap<String, u32>,
    ) -> Vec<String> {
        let mut views = Vec::with_capacity(candidates.len());
        for (idx, name) in candidates.iter().enumerate() {
            if let Some(cluster) = self.inventory.cluster(name).await {
                views.push((idx, cluster));
            }
        }

        if !gpr.selection.manual_cluster() {
            views.sort_by_key(|(idx, cluster)| {
                (
                    debt.get(&cluster.name).copied().unwrap_or(0),
                    load_permille(cluster),
                    *idx,
                )
            });
        }

        views.into_iter().map(|(_, c)| c.name).collect()
    }

    /// Select a cluster and nodes for the GPR and reserve them.
    ///
    /// Either every node of the placement is reserved for `gpr.id` or none
    /// is, in which case `InsufficientCapacity` is returned.
    pub async fn select(
        &self,
        gpr: &GpuRequest,
        candidates: &[String],
        debt: &HashMap<String, u32>,
    ) -> EgsResult<Placement> {
        for cluster_name in self.rank(gpr, candidates, debt).await {
            let lock = self.cluster_lock(&cluster_name).await;
            let _guard = lock.lock().await;

            // Decide on a view taken under the selection lock
            let Some(cluster) = self.inventory.cluster(&cluster_name).await else {
                continue;
            };
            let Some(placement) = self.strategy.place(gpr, &cluster) else {
                debug!(
                    gpr_id = %gpr.id,
                    cluster = %cluster_name,
                    "Cluster cannot satisfy request"
                );
                continue;
            };

            if self.reserve_all(gpr, &placement).await {
                info!(
                    gpr_id = %gpr.id,
                    cluster = %placement.cluster_name,
                    gpu_shape = %placement.gpu_shape,
                    nodes = placement.nodes.len(),
                    gpus = placement.total_gpus(),
                    "Reserved placement"
                );
                return Ok(placement);
            }
        }

        Err(EgsError::InsufficientCapacity(format!(
            "no candidate cluster can host {} node(s) x {} GPU(s)",
            gpr.node_count, gpr.gpu_per_node_count
        )))
    }

    async fn reserve_all(&self, gpr: &GpuRequest, placement: &Placement) -> bool {
        let mut reserved: Vec<&NodeAllocation> = Vec::with_capacity(placement.nodes.len());
        for alloc in &placement.nodes {
            match self
                .inventory
                .reserve(gpr.id, &placement.cluster_name, &alloc.node_name, alloc.gpu_count)
                .await
            {
                Ok(()) => reserved.push(alloc),
                Err(e) => {
                    warn!(
                        gpr_id = %gpr.id,
                        cluster = %placement.cluster_name,
                        node = %alloc.node_name,
                        error = %e,
                        "Node reservation failed; rolling back"
                    );
                    for done in reserved {
                        self.inventory
                            .release(gpr.id, &placement.cluster_name, &done.node_name, done.gpu_count)
                            .await;
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Return every GPU of a placement held by the GPR
    pub async fn release(&self, gpr: &GpuRequest, placement: &Placement) -> u32 {
        let mut released = 0;
        for alloc in &placement.nodes {
            released += self
                .inventory
                .release(gpr.id, &placement.cluster_name, &alloc.node_name, alloc.gpu_count)
                .await;
        }
        released
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::inventory_index::tests::raw_node;
    use chrono::Utc;
    use egs_core::{GprState, SelectionMode};
    use uuid::Uuid;

    pub(crate) fn gpr(node_count: u32, gpu_per_node_count: u32) -> GpuRequest {
        GpuRequest {
            id: Uuid::new_v4(),
            request_name: "req".to_string(),
            workspace_name: "team-a".to_string(),
            priority: 200,
            memory_per_gpu: 40,
            exit_duration: "1h".parse().unwrap(),
            node_count,
            gpu_per_node_count,
            selection: SelectionMode::AutoGpuAutoCluster,
            cluster_constraint: Vec::new(),
            gpu_shape_constraint: None,
            instance_type_constraint: None,
            state: GprState::Queued,
            created_at: Utc::now(),
            enforce_idle_timeout: false,
            idle_timeout_duration: None,
            enable_eviction: false,
            requeue_on_failure: false,
            template_name: None,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn engine_with(items: &[egs_core::RawInventoryItem]) -> (Arc<InventoryIndex>, SelectionEngine) {
        let inventory = Arc::new(InventoryIndex::new());
        inventory.seed(items).await;
        let engine = SelectionEngine::new(inventory.clone());
        (inventory, engine)
    }

    #[test]
    fn test_least_loaded_prefers_idle_nodes() {
        let mut busy = Node::from_raw(&raw_node("worker-1", "n0", "A100", 4));
        busy.available_gpu_count = 1;
        let idle = Node::from_raw(&raw_node("worker-1", "n1", "A100", 4));
        let cluster = Cluster {
            name: "worker-1".to_string(),
            nodes: vec![busy, idle],
        };

        let placement = LeastLoadedStrategy.place(&gpr(1, 1), &cluster).unwrap();
        assert_eq!(placement.nodes[0].node_name, "n1");
    }

    #[test]
    fn test_placement_respects_shape_and_memory() {
        let cluster = Cluster {
            name: "worker-1".to_string(),
            nodes: vec![
                Node::from_raw(&raw_node("worker-1", "a0", "A100", 2)),
                Node::from_raw(&raw_node("worker-1", "h0", "H100", 2)),
            ],
        };

        let mut req = gpr(1, 1);
        req.gpu_shape_constraint = Some("H100".to_string());
        let placement = LeastLoadedStrategy.place(&req, &cluster).unwrap();
        assert_eq!(placement.nodes[0].node_name, "h0");
        assert_eq!(placement.instance_type, "h100-instance");

        req.memory_per_gpu = 80;
        assert!(LeastLoadedStrategy.place(&req, &cluster).is_none());
    }

    #[test]
    fn test_multi_node_needs_distinct_nodes_of_one_shape() {
        let cluster = Cluster {
            name: "worker-1".to_string(),
            nodes: vec![
                Node::from_raw(&raw_node("worker-1", "a0", "A100", 4)),
                Node::from_raw(&raw_node("worker-1", "h0", "H100", 4)),
            ],
        };
        assert!(LeastLoadedStrategy.place(&gpr(2, 1), &cluster).is_none());
    }

    #[tokio::test]
    async fn test_auto_cluster_prefers_less_loaded_cluster() {
        let (inventory, engine) = engine_with(&[
            raw_node("worker-1", "n0", "A100", 4),
            raw_node("worker-2", "n0", "A100", 4),
        ])
        .await;
        inventory
            .reserve(Uuid::new_v4(), "worker-1", "n0", 3)
            .await
            .unwrap();

        let placement = engine
            .select(&gpr(1, 1), &names(&["worker-1", "worker-2"]), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(placement.cluster_name, "worker-2");
    }

    #[tokio::test]
    async fn test_priority_debt_outranks_load() {
        let (_, engine) = engine_with(&[
            raw_node("worker-1", "n0", "A100", 4),
            raw_node("worker-2", "n0", "A100", 4),
        ])
        .await;

        let debt = HashMap::from([("worker-1".to_string(), 4)]);
        let placement = engine
            .select(&gpr(1, 1), &names(&["worker-1", "worker-2"]), &debt)
            .await
            .unwrap();
        assert_eq!(placement.cluster_name, "worker-2");
    }

    #[tokio::test]
    async fn test_manual_cluster_keeps_list_order() {
        let (inventory, engine) = engine_with(&[
            raw_node("worker-1", "n0", "A100", 4),
            raw_node("worker-2", "n0", "A100", 4),
        ])
        .await;
        inventory
            .reserve(Uuid::new_v4(), "worker-1", "n0", 3)
            .await
            .unwrap();

        let mut req = gpr(1, 1);
        req.selection = SelectionMode::AutoGpuManualCluster;
        let placement = engine
            .select(&req, &names(&["worker-1", "worker-2"]), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(placement.cluster_name, "worker-1");
    }

    #[tokio::test]
    async fn test_manual_gpu_manual_cluster_no_substitution() {
        let (_, engine) = engine_with(&[
            raw_node("worker-1", "n0", "A100", 4),
            raw_node("worker-2", "n0", "H100", 4),
        ])
        .await;

        let mut req = gpr(1, 1);
        req.selection = SelectionMode::ManualGpuManualCluster;
        req.gpu_shape_constraint = Some("H100".to_string());
        let result = engine.select(&req, &names(&["worker-1"]), &HashMap::new()).await;
        assert!(matches!(result, Err(EgsError::InsufficientCapacity(_))));
    }

    #[tokio::test]
    async fn test_failed_selection_reserves_nothing() {
        let (inventory, engine) = engine_with(&[
            raw_node("worker-1", "n0", "A100", 2),
            raw_node("worker-1", "n1", "A100", 2),
        ])
        .await;

        let result = engine
            .select(&gpr(3, 2), &names(&["worker-1"]), &HashMap::new())
            .await;
        assert!(result.is_err());
        assert_eq!(inventory.cluster("worker-1").await.unwrap().available_gpus(), 4);
    }

    #[tokio::test]
    async fn test_release_returns_capacity() {
        let (inventory, engine) = engine_with(&[
            raw_node("worker-1", "n0", "A100", 2),
            raw_node("worker-1", "n1", "A100", 2),
        ])
        .await;

        let req = gpr(2, 2);
        let placement = engine
            .select(&req, &names(&["worker-1"]), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(inventory.cluster("worker-1").await.unwrap().available_gpus(), 0);

        assert_eq!(engine.release(&req, &placement).await, 4);
        assert_eq!(engine.release(&req, &placement).await, 0);
        assert_eq!(inventory.cluster("worker-1").await.unwrap().available_gpus(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_multi_node_admission_exactly_one_wins() {
        let (inventory, engine) = engine_with(&[
            raw_node("worker-1", "n0", "A100", 2),
            raw_node("worker-1", "n1", "A100", 2),
            raw_node("worker-1", "n2", "A100", 2),
        ])
        .await;
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .select(&gpr(2, 2), &names(&["worker-1"]), &HashMap::new())
                    .await
            }));
        }

        let mut ok = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(EgsError::InsufficientCapacity(_)) => insufficient += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!((ok, insufficient), (1, 1));
        assert_eq!(inventory.cluster("worker-1").await.unwrap().available_gpus(), 2);
    }
}
