//! Inventory index tracking per-node GPU capacity and reservations

use egs_core::{
    Cluster, EgsError, EgsResult, GprId, InventoryEvent, Node, NodeStatus, RawInventoryItem,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Node record plus the GPUs each GPR holds on it
#[derive(Debug)]
struct NodeSlot {
    node: Node,
    held: HashMap<GprId, u32>,
}

impl NodeSlot {
    fn held_total(&self) -> u32 {
        self.held.values().sum()
    }

    /// Take fresh feed data while keeping the reservations already granted
    fn refresh(&mut self, fresh: Node) {
        let held = self.held_total();
        if held > fresh.total_gpu_count {
            warn!(
                cluster = %fresh.cluster_name,
                node = %fresh.name,
                held = held,
                total = fresh.total_gpu_count,
                "Node shrank below its reserved GPUs"
            );
        }
        let available = fresh
            .available_gpu_count
            .min(fresh.total_gpu_count.saturating_sub(held));
        self.node = Node {
            available_gpu_count: available,
            ..fresh
        };
    }
}

#[derive(Debug)]
struct NodeEntry {
    name: String,
    slot: Arc<Mutex<NodeSlot>>,
}

impl NodeEntry {
    fn new(node: Node) -> Self {
        Self {
            name: node.name.clone(),
            slot: Arc::new(Mutex::new(NodeSlot {
                node,
                held: HashMap::new(),
            })),
        }
    }
}

#[derive(Debug)]
struct ClusterEntry {
    name: String,
    nodes: Vec<NodeEntry>,
}

/// Per-cluster, per-node GPU capacity index.
///
/// `reserve` and `release` are the only operations that mutate availability;
/// both serialize on the target node's lock. Clusters keep the order in which
/// the feed first reported them.
#[derive(Debug, Default)]
pub struct InventoryIndex {
    clusters: RwLock<Vec<ClusterEntry>>,
    /// Bumped whenever capacity may have grown: feed events and releases
    generation: AtomicU64,
}

impl InventoryIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the index from raw items, grouped by cluster in first-seen order
    pub async fn seed(&self, items: &[RawInventoryItem]) {
        let mut grouped: Vec<(String, Vec<RawInventoryItem>)> = Vec::new();
        for item in items {
            match grouped.iter_mut().find(|(c, _)| *c == item.cluster_name) {
                Some((_, group)) => group.push(item.clone()),
                None => grouped.push((item.cluster_name.clone(), vec![item.clone()])),
            }
        }

        for (cluster_name, items) in grouped {
            self.apply(InventoryEvent::Snapshot {
                cluster_name,
                items,
            })
            .await;
        }
    }

    /// Apply a feed event
    pub async fn apply(&self, event: InventoryEvent) {
        match event {
            InventoryEvent::Snapshot {
                cluster_name,
                items,
            } => self.apply_snapshot(cluster_name, items).await,
            InventoryEvent::ClusterRemoved { cluster_name } => {
                self.remove_cluster(&cluster_name).await
            }
        }
        self.mark_changed();
    }

    /// Current capacity generation. A selection that failed at generation
    /// `g` cannot succeed until the generation moves past `g`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Record that capacity may have grown outside of `apply` and `release`,
    /// such as a workspace gaining a cluster
    pub fn mark_changed(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    async fn apply_snapshot(&self, cluster_name: String, items: Vec<RawInventoryItem>) {
        let mut clusters = self.clusters.write().await;
        let idx = match clusters.iter().position(|c| c.name == cluster_name) {
            Some(idx) => idx,
            None => {
                info!(cluster = %cluster_name, "Cluster added to inventory");
                clusters.push(ClusterEntry {
                    name: cluster_name.clone(),
                    nodes: Vec::new(),
                });
                clusters.len() - 1
            }
        };
        let entry = &mut clusters[idx];

        let mut previous: Vec<NodeEntry> = std::mem::take(&mut entry.nodes);
        let mut next = Vec::with_capacity(items.len());

        for item in &items {
            if item.cluster_name != cluster_name {
                warn!(
                    cluster = %cluster_name,
                    node = %item.gpu_node_name,
                    reported_cluster = %item.cluster_name,
                    "Skipping inventory item for another cluster"
                );
                continue;
            }
            let fresh = Node::from_raw(item);
            match previous.iter().position(|n| n.name == fresh.name) {
                Some(pos) => {
                    let existing = previous.swap_remove(pos);
                    existing.slot.lock().await.refresh(fresh);
                    next.push(existing);
                }
                None => next.push(NodeEntry::new(fresh)),
            }
        }

        for stale in previous {
            if Self::retire(&stale).await {
                next.push(stale);
            }
        }

        debug!(cluster = %cluster_name, nodes = next.len(), "Applied inventory snapshot");
        entry.nodes = next;
    }

    async fn remove_cluster(&self, cluster_name: &str) {
        let mut clusters = self.clusters.write().await;
        let Some(idx) = clusters.iter().position(|c| c.name == cluster_name) else {
            return;
        };

        let nodes = std::mem::take(&mut clusters[idx].nodes);
        let mut kept = Vec::new();
        for node in nodes {
            if Self::retire(&node).await {
                kept.push(node);
            }
        }

        if kept.is_empty() {
            clusters.remove(idx);
            info!(cluster = %cluster_name, "Cluster removed from inventory");
        } else {
            warn!(
                cluster = %cluster_name,
                nodes = kept.len(),
                "Cluster removed while nodes still hold reservations"
            );
            clusters[idx].nodes = kept;
        }
    }

    /// Mark a node that vanished from the feed. Returns whether it must be
    /// kept because GPRs still hold GPUs on it.
    async fn retire(entry: &NodeEntry) -> bool {
        let mut slot = entry.slot.lock().await;
        if slot.held.is_empty() {
            return false;
        }
        slot.node.status = NodeStatus::Gone;
        true
    }

    async fn slot(&self, cluster_name: &str, node_name: &str) -> Option<Arc<Mutex<NodeSlot>>> {
        let clusters = self.clusters.read().await;
        clusters
            .iter()
            .find(|c| c.name == cluster_name)?
            .nodes
            .iter()
            .find(|n| n.name == node_name)
            .map(|n| n.slot.clone())
    }

    /// Read-only view of every node
    pub async fn snapshot(&self) -> Vec<Node> {
        self.clusters()
            .await
            .into_iter()
            .flat_map(|c| c.nodes)
            .collect()
    }

    /// Read-only view of every cluster in declaration order
    pub async fn clusters(&self) -> Vec<Cluster> {
        let clusters = self.clusters.read().await;
        let mut out = Vec::with_capacity(clusters.len());
        for entry in clusters.iter() {
            let mut nodes = Vec::with_capacity(entry.nodes.len());
            for node in &entry.nodes {
                nodes.push(node.slot.lock().await.node.clone());
            }
            out.push(Cluster {
                name: entry.name.clone(),
                nodes,
            });
        }
        out
    }

    /// Read-only view of one cluster
    pub async fn cluster(&self, cluster_name: &str) -> Option<Cluster> {
        let clusters = self.clusters.read().await;
        let entry = clusters.iter().find(|c| c.name == cluster_name)?;
        let mut nodes = Vec::with_capacity(entry.nodes.len());
        for node in &entry.nodes {
            nodes.push(node.slot.lock().await.node.clone());
        }
        Some(Cluster {
            name: entry.name.clone(),
            nodes,
        })
    }

    /// Reserve GPUs on a node for a GPR. All or nothing.
    pub async fn reserve(
        &self,
        owner: GprId,
        cluster_name: &str,
        node_name: &str,
        gpu_count: u32,
    ) -> EgsResult<()> {
        let slot = self.slot(cluster_name, node_name).await.ok_or_else(|| {
            EgsError::ResourceNotFound(format!("node {}/{}", cluster_name, node_name))
        })?;
        let mut slot = slot.lock().await;

        if !slot.node.is_schedulable() {
            return Err(EgsError::InsufficientCapacity(format!(
                "node {}/{} is {}",
                cluster_name, node_name, slot.node.status
            )));
        }
        if gpu_count > slot.node.available_gpu_count {
            return Err(EgsError::InsufficientCapacity(format!(
                "node {}/{}: requested {}, available {}",
                cluster_name, node_name, gpu_count, slot.node.available_gpu_count
            )));
        }

        slot.node.available_gpu_count -= gpu_count;
        *slot.held.entry(owner).or_insert(0) += gpu_count;

        debug!(
            gpr_id = %owner,
            cluster = %cluster_name,
            node = %node_name,
            gpus = gpu_count,
            available = slot.node.available_gpu_count,
            "Reserved GPUs"
        );

        Ok(())
    }

    /// Return GPUs a GPR holds on a node.
    ///
    /// Only what the owner actually holds is credited back, so releasing the
    /// same reservation twice is a no-op. Over-release is an accounting bug
    /// elsewhere and is logged, never propagated. Returns the GPUs released.
    pub async fn release(
        &self,
        owner: GprId,
        cluster_name: &str,
        node_name: &str,
        gpu_count: u32,
    ) -> u32 {
        let Some(slot) = self.slot(cluster_name, node_name).await else {
            error!(
                gpr_id = %owner,
                cluster = %cluster_name,
                node = %node_name,
                "Release on unknown node"
            );
            return 0;
        };
        let mut slot = slot.lock().await;

        let held = slot.held.get(&owner).copied().unwrap_or(0);
        let amount = gpu_count.min(held);
        if amount < gpu_count {
            error!(
                gpr_id = %owner,
                cluster = %cluster_name,
                node = %node_name,
                requested = gpu_count,
                held = held,
                "Over-release attempted"
            );
        }
        if amount == 0 {
            return 0;
        }

        if amount == held {
            slot.held.remove(&owner);
        } else if let Some(h) = slot.held.get_mut(&owner) {
            *h -= amount;
        }

        let room = slot.node.total_gpu_count - slot.node.available_gpu_count;
        if amount > room {
            error!(
                gpr_id = %owner,
                cluster = %cluster_name,
                node = %node_name,
                amount = amount,
                room = room,
                "Release would exceed node total; capping"
            );
        }
        slot.node.available_gpu_count += amount.min(room);
        self.mark_changed();

        debug!(
            gpr_id = %owner,
            cluster = %cluster_name,
            node = %node_name,
            gpus = amount,
            available = slot.node.available_gpu_count,
            "Released GPUs"
        );

        amount
    }
}
