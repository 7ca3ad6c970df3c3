//! Priority admission queue

use chrono::{DateTime, Utc};
use egs_core::{GprId, GpuRequest};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use tokio::sync::Mutex;
use tracing::debug;

/// A pending GPR as seen by the queue
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: GprId,
    pub workspace_name: String,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    /// Enqueue sequence number, breaks ties between equal timestamps
    order: u64,
    /// Matches the live generation while this entry is current
    generation: u64,
}

impl QueueEntry {
    fn key(&self) -> (u32, DateTime<Utc>, u64) {
        (self.priority, self.created_at, self.order)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heaps: HashMap<String, BinaryHeap<QueueEntry>>,
    /// Current generation of every queued id; heap entries with another
    /// generation are stale and skipped
    live: HashMap<GprId, u64>,
    next_seq: u64,
}

impl QueueState {
    fn is_live(&self, entry: &QueueEntry) -> bool {
        self.live.get(&entry.id) == Some(&entry.generation)
    }

    fn push(&mut self, mut entry: QueueEntry) {
        self.next_seq += 1;
        entry.generation = self.next_seq;
        self.live.insert(entry.id, entry.generation);
        self.heaps
            .entry(entry.workspace_name.clone())
            .or_default()
            .push(entry);
    }

    /// Drop stale entries from the top of a workspace heap
    fn settle(&mut self, workspace_name: &str) {
        let Some(heap) = self.heaps.get_mut(workspace_name) else {
            return;
        };
        while let Some(top) = heap.peek() {
            if self.live.get(&top.id) == Some(&top.generation) {
                break;
            }
            heap.pop();
        }
        if heap.is_empty() {
            self.heaps.remove(workspace_name);
        }
    }
}

/// Per-workspace min-heaps keyed by `(priority, createdAt)`.
///
/// Lower priority values are served first; equal priorities are served in
/// enqueue order. Cancelled or re-prioritized entries are dropped lazily.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a GPR at its priority
    pub async fn enqueue(&self, gpr: &GpuRequest) {
        let mut state = self.state.lock().await;
        state.next_seq += 1;
        let order = state.next_seq;
        state.push(QueueEntry {
            id: gpr.id,
            workspace_name: gpr.workspace_name.clone(),
            priority: gpr.priority,
            created_at: gpr.created_at,
            order,
            generation: 0,
        });
        debug!(
            gpr_id = %gpr.id,
            workspace = %gpr.workspace_name,
            priority = gpr.priority,
            "Enqueued GPR"
        );
    }

    /// Put a dequeued entry back without losing its place in its band
    pub async fn restore(&self, entry: QueueEntry) {
        self.state.lock().await.push(entry);
    }

    /// Remove and return the highest-precedence entry across workspaces
    pub async fn dequeue_next(&self) -> Option<QueueEntry> {
        let mut state = self.state.lock().await;
        let workspaces: Vec<String> = state.heaps.keys().cloned().collect();
        for ws in &workspaces {
            state.settle(ws);
        }

        // Max by Ord is the smallest key
        let best = state
            .heaps
            .iter()
            .filter_map(|(ws, heap)| heap.peek().map(|top| (ws.clone(), top.clone())))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(ws, _)| ws)?;

        let entry = state.heaps.get_mut(&best)?.pop()?;
        state.live.remove(&entry.id);
        state.settle(&best);
        Some(entry)
    }

    /// Remove a queued GPR. Returns false if it is not currently queued.
    pub async fn cancel(&self, id: GprId) -> bool {
        self.state.lock().await.live.remove(&id).is_some()
    }

    /// Move a queued GPR to a new priority band, keeping its enqueue order.
    /// Returns false if it is not currently queued.
    pub async fn reprioritize(&self, id: GprId, priority: u32) -> bool {
        let mut state = self.state.lock().await;
        let Some(&generation) = state.live.get(&id) else {
            return false;
        };

        let current = state.heaps.values().find_map(|heap| {
            heap.iter()
                .find(|e| e.id == id && e.generation == generation)
                .cloned()
        });
        let Some(mut entry) = current else {
            return false;
        };

        entry.priority = priority;
        state.push(entry);
        true
    }

    /// Number of queued GPRs
    pub async fn len(&self) -> usize {
        self.state.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queued GPRs per workspace
    pub async fn depth_by_workspace(&self) -> BTreeMap<String, usize> {
        let state = self.state.lock().await;
        let mut depth = BTreeMap::new();
        for (ws, heap) in &state.heaps {
            let live = heap.iter().filter(|e| state.is_live(e)).count();
            if live > 0 {
                depth.insert(ws.clone(), live);
            }
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::tests::gpr;
    use chrono::Duration;

    fn request(workspace: &str, priority: u32) -> GpuRequest {
        let mut r = gpr(1, 1);
        r.workspace_name = workspace.to_string();
        r.priority = priority;
        r
    }

    async fn drain(queue: &AdmissionQueue) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(entry) = queue.dequeue_next().await {
            out.push(entry.priority);
        }
        out
    }

    #[tokio::test]
    async fn test_priority_order() {
        let queue = AdmissionQueue::new();
        for p in [200, 100, 150] {
            queue.enqueue(&request("team-a", p)).await;
        }
        assert_eq!(drain(&queue).await, vec![100, 150, 200]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_fifo_within_band() {
        let queue = AdmissionQueue::new();
        let first = request("team-a", 100);
        let second = request("team-a", 100);
        queue.enqueue(&first).await;
        queue.enqueue(&second).await;

        assert_eq!(queue.dequeue_next().await.unwrap().id, first.id);
        assert_eq!(queue.dequeue_next().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_earlier_creation_wins_over_enqueue_order() {
        let queue = AdmissionQueue::new();
        let mut older = request("team-a", 100);
        older.created_at = Utc::now() - Duration::minutes(5);
        let newer = request("team-a", 100);

        queue.enqueue(&newer).await;
        queue.enqueue(&older).await;
        assert_eq!(queue.dequeue_next().await.unwrap().id, older.id);
    }

    #[tokio::test]
    async fn test_cancel() {
        let queue = AdmissionQueue::new();
        let a = request("team-a", 100);
        let b = request("team-a", 200);
        queue.enqueue(&a).await;
        queue.enqueue(&b).await;

        assert!(queue.cancel(a.id).await);
        assert!(!queue.cancel(a.id).await);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.dequeue_next().await.unwrap().id, b.id);
        assert!(queue.dequeue_next().await.is_none());
    }

    #[tokio::test]
    async fn test_reprioritize() {
        let queue = AdmissionQueue::new();
        let a = request("team-a", 100);
        let b = request("team-a", 200);
        queue.enqueue(&a).await;
        queue.enqueue(&b).await;

        assert!(queue.reprioritize(b.id, 50).await);
        assert_eq!(queue.len().await, 2);
        assert_eq!(drain(&queue).await, vec![50, 100]);
        assert!(!queue.reprioritize(b.id, 10).await);
    }

    #[tokio::test]
    async fn test_restore_keeps_place() {
        let queue = AdmissionQueue::new();
        let a = request("team-a", 100);
        let b = request("team-a", 100);
        queue.enqueue(&a).await;
        queue.enqueue(&b).await;

        let head = queue.dequeue_next().await.unwrap();
        assert_eq!(head.id, a.id);
        queue.restore(head).await;
        assert_eq!(queue.dequeue_next().await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_workspaces_share_dispatch() {
        let queue = AdmissionQueue::new();
        queue.enqueue(&request("team-a", 200)).await;
        queue.enqueue(&request("team-b", 100)).await;

        let depth = queue.depth_by_workspace().await;
        assert_eq!(depth.get("team-a"), Some(&1));

        let head = queue.dequeue_next().await.unwrap();
        assert_eq!(head.workspace_name, "team-b");
    }
}
