//! Main scheduler logic

use chrono::{DateTime, Utc};
use egs_core::{
    Cluster, CreateGprRequest, Credential, EgsError, EgsResult, FailureInfo, GprId, GprSnapshot,
    GprState, GprTemplate, GprTemplateBinding, GpuRequest, InventoryEvent, InventoryUsage,
    ReleaseOutcome, SchedulerConfig, SelectionMode, WorkloadSignal,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::inventory_index::InventoryIndex;
use crate::lifecycle::{GprRecord, LifecycleEvent, Transition};
use crate::queue::{AdmissionQueue, QueueEntry};
use crate::registry::WorkspaceRegistry;
use crate::resolver::TemplateResolver;
use crate::selection::{node_matches, shape_groups, SelectionEngine};
use crate::store::TemplateStore;

/// Priority used when neither the request nor a template sets one
pub const DEFAULT_PRIORITY: u32 = 200;

type RecordsMap = HashMap<GprId, Arc<Mutex<GprRecord>>>;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub completed: usize,
    pub evicted: usize,
    pub requeued: usize,
    pub purged: usize,
}

/// Engine-wide counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub queued: usize,
    pub queued_by_workspace: BTreeMap<String, usize>,
    pub gprs_by_state: BTreeMap<String, usize>,
    pub clusters: usize,
    pub total_gpus: u32,
    pub available_gpus: u32,
}

/// Scheduler owns every GPR and drives admission, selection and lifecycle
pub struct GprScheduler {
    /// Per-node capacity and reservations
    inventory: Arc<InventoryIndex>,
    /// Templates and bindings
    store: Arc<TemplateStore>,
    resolver: TemplateResolver,
    selection: SelectionEngine,
    queue: AdmissionQueue,
    /// Workspace cluster membership
    registry: Arc<dyn WorkspaceRegistry>,
    /// GPRs indexed by ID. Each record's mutex also guards its in-flight
    /// admission.
    records: RwLock<RecordsMap>,
    config: SchedulerConfig,
    /// Signalled when requests arrive or capacity may have freed up
    wake: Notify,
    /// Serializes dispatch passes
    dispatch_lock: Mutex<()>,
}

fn failure_of(e: &EgsError) -> FailureInfo {
    FailureInfo {
        kind: e.kind(),
        reason: e.to_string(),
    }
}

/// Charge a blocked GPR's demand against each of its candidate clusters
fn add_debt(debt: &mut HashMap<String, u32>, clusters: &[String], gpus: u32) {
    for cluster in clusters {
        let owed = debt.entry(cluster.clone()).or_insert(0);
        *owed = owed.saturating_add(gpus);
    }
}

fn missing(field: &str) -> EgsError {
    EgsError::BadParameters(format!(
        "{} is required when no template supplies it",
        field
    ))
}

impl GprScheduler {
    /// Create a new scheduler
    pub fn new(config: SchedulerConfig, registry: Arc<dyn WorkspaceRegistry>) -> Self {
        let inventory = Arc::new(InventoryIndex::new());
        let store = Arc::new(TemplateStore::new());

        info!(
            max_selection_retries = config.max_selection_retries,
            sweep_interval_secs = config.sweep_interval_secs,
            "Scheduler initialized"
        );

        Self {
            resolver: TemplateResolver::new(store.clone(), inventory.clone()),
            selection: SelectionEngine::new(inventory.clone()),
            inventory,
            store,
            queue: AdmissionQueue::new(),
            registry,
            records: RwLock::new(HashMap::new()),
            config,
            wake: Notify::new(),
            dispatch_lock: Mutex::new(()),
        }
    }

    pub fn inventory_index(&self) -> &Arc<InventoryIndex> {
        &self.inventory
    }

    async fn record(&self, id: GprId) -> EgsResult<Arc<Mutex<GprRecord>>> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EgsError::ResourceNotFound(format!("GPR {}", id)))
    }

    /// Create a GPR and queue it for admission
    pub async fn create_gpr(
        &self,
        credential: &Credential,
        request: CreateGprRequest,
    ) -> EgsResult<GprId> {
        let gpr = self.build_request(credential, request).await?;
        let id = gpr.id;

        info!(
            gpr_id = %id,
            name = %gpr.request_name,
            workspace = %gpr.workspace_name,
            priority = gpr.priority,
            nodes = gpr.node_count,
            gpus_per_node = gpr.gpu_per_node_count,
            selection = ?gpr.selection,
            "Creating GPR"
        );

        self.queue.enqueue(&gpr).await;
        let record = GprRecord::new(gpr, credential.clone());
        self.records
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(record)));
        self.wake.notify_one();

        Ok(id)
    }

    /// Normalize a create request, filling gaps from the resolved template
    async fn build_request(
        &self,
        credential: &Credential,
        req: CreateGprRequest,
    ) -> EgsResult<GpuRequest> {
        if req.request_name.trim().is_empty() {
            return Err(EgsError::BadParameters("requestName is required".to_string()));
        }
        if req.workspace_name.trim().is_empty() {
            return Err(EgsError::BadParameters("workspaceName is required".to_string()));
        }

        let reachable = self
            .registry
            .workspace_clusters(credential, &req.workspace_name)
            .await?;
        if let Some(unknown) = req.clusters.iter().find(|c| !reachable.contains(c)) {
            return Err(EgsError::BadParameters(format!(
                "cluster '{}' is not bound to workspace '{}'",
                unknown, req.workspace_name
            )));
        }
        let candidates = if req.clusters.is_empty() {
            reachable.clone()
        } else {
            req.clusters.clone()
        };

        let resolved = match &req.template_name {
            Some(name) => {
                let resolved = self.resolver.resolve_named(name, &req.clusters).await?;
                if !reachable.contains(&resolved.cluster_name) {
                    return Err(EgsError::BadParameters(format!(
                        "template '{}' targets cluster '{}', which workspace '{}' cannot reach",
                        name, resolved.cluster_name, req.workspace_name
                    )));
                }
                Some(resolved)
            }
            None => {
                let needs_defaults = req.node_count.is_none()
                    || req.gpu_per_node_count.is_none()
                    || req.exit_duration.is_none();
                if req.instance_type.is_none() && (req.gpu_shape.is_none() || needs_defaults) {
                    self.resolver
                        .resolve_auto(&req.workspace_name, req.gpu_shape.as_deref(), &candidates)
                        .await?
                } else {
                    None
                }
            }
        };
        let template: Option<&GprTemplate> = resolved.as_ref().map(|r| &r.template);

        let node_count = req
            .node_count
            .or(template.map(|t| t.num_gpu_nodes))
            .ok_or_else(|| missing("nodeCount"))?;
        let gpu_per_node_count = req
            .gpu_per_node_count
            .or(template.map(|t| t.gpu_per_node_count))
            .ok_or_else(|| missing("gpuPerNodeCount"))?;
        let exit_duration = req
            .exit_duration
            .or(template.map(|t| t.exit_duration))
            .ok_or_else(|| missing("exitDuration"))?;
        if node_count == 0 || gpu_per_node_count == 0 {
            return Err(EgsError::BadParameters(
                "nodeCount and gpuPerNodeCount must be at least 1".to_string(),
            ));
        }
        if node_count.checked_mul(gpu_per_node_count).is_none() {
            return Err(EgsError::BadParameters(format!(
                "{} nodes of {} GPUs exceeds the GPU count limit",
                node_count, gpu_per_node_count
            )));
        }
        if exit_duration.is_zero() {
            return Err(EgsError::BadParameters("exitDuration must be non-zero".to_string()));
        }

        let enforce_idle_timeout = req
            .enforce_idle_timeout
            .or(template.map(|t| t.enforce_idle_timeout))
            .unwrap_or(false);
        let idle_timeout_duration = req
            .idle_timeout_duration
            .or(template.and_then(|t| t.idle_timeout_duration));
        if enforce_idle_timeout && idle_timeout_duration.map_or(true, |d| d.is_zero()) {
            return Err(EgsError::BadParameters(
                "idleTimeoutDuration is required when enforceIdleTimeout is set".to_string(),
            ));
        }

        let cluster_constraint = match &resolved {
            Some(r) if req.clusters.is_empty() => vec![r.cluster_name.clone()],
            _ => req.clusters.clone(),
        };

        let gpr = GpuRequest {
            id: Uuid::new_v4(),
            request_name: req.request_name.clone(),
            workspace_name: req.workspace_name.clone(),
            priority: req
                .priority
                .or(template.map(|t| t.priority))
                .unwrap_or(DEFAULT_PRIORITY),
            memory_per_gpu: req
                .memory_per_gpu
                .or(template.map(|t| t.memory_per_gpu))
                .unwrap_or(0),
            exit_duration,
            node_count,
            gpu_per_node_count,
            selection: SelectionMode::from_constraints(
                req.gpu_shape.is_some() || req.instance_type.is_some(),
                !req.clusters.is_empty(),
            ),
            gpu_shape_constraint: req
                .gpu_shape
                .clone()
                .or(template.map(|t| t.gpu_shape.clone())),
            instance_type_constraint: req
                .instance_type
                .clone()
                .or(template.map(|t| t.instance_type.clone())),
            cluster_constraint,
            state: GprState::Queued,
            created_at: Utc::now(),
            enforce_idle_timeout,
            idle_timeout_duration,
            enable_eviction: req
                .enable_eviction
                .or(template.map(|t| t.enable_eviction))
                .unwrap_or(false),
            requeue_on_failure: req
                .requeue_on_failure
                .or(template.map(|t| t.requeue_on_failure))
                .unwrap_or(false),
            template_name: template.map(|t| t.name.clone()),
        };

        let check_against = if gpr.cluster_constraint.is_empty() {
            &reachable
        } else {
            &gpr.cluster_constraint
        };
        self.ensure_feasible(&gpr, check_against).await?;
        Ok(gpr)
    }

    /// Reject requests no known candidate cluster could ever host
    async fn ensure_feasible(&self, gpr: &GpuRequest, candidates: &[String]) -> EgsResult<()> {
        let mut known = false;
        for name in candidates {
            let Some(cluster) = self.inventory.cluster(name).await else {
                continue;
            };
            known = true;
            let groups = shape_groups(cluster.nodes.iter().filter(|n| node_matches(gpr, n)));
            if groups
                .iter()
                .any(|(_, nodes)| nodes.len() >= gpr.node_count as usize)
            {
                return Ok(());
            }
        }

        // Clusters the feed has not reported yet may still arrive
        if !known {
            return Ok(());
        }
        Err(EgsError::InsufficientCapacity(format!(
            "no candidate cluster has {} node(s) of one shape with {} GPU(s) matching the request",
            gpr.node_count, gpr.gpu_per_node_count
        )))
    }

    /// Clusters a queued GPR may currently be placed on
    async fn candidate_clusters(&self, record: &GprRecord) -> EgsResult<Vec<String>> {
        let reachable = self
            .registry
            .workspace_clusters(&record.credential, &record.request.workspace_name)
            .await?;
        if record.request.cluster_constraint.is_empty() {
            return Ok(reachable);
        }
        Ok(record
            .request
            .cluster_constraint
            .iter()
            .filter(|c| reachable.contains(c))
            .cloned()
            .collect())
    }

    /// Run one admission pass over the queue. Returns the number of GPRs
    /// admitted.
    ///
    /// Once a GPR fails selection, later GPRs of the same workspace and
    /// priority wait for the next pass; lower-precedence GPRs may still
    /// backfill. A GPR that already failed against the current inventory
    /// generation is not retried until capacity changes.
    pub async fn dispatch_once(&self) -> usize {
        let _pass = self.dispatch_lock.lock().await;

        let mut blocked: HashSet<(String, u32)> = HashSet::new();
        let mut deferred: Vec<QueueEntry> = Vec::new();
        let mut debt: HashMap<String, u32> = HashMap::new();
        let mut admitted = 0;

        while let Some(entry) = self.queue.dequeue_next().await {
            let band = (entry.workspace_name.clone(), entry.priority);
            if blocked.contains(&band) {
                deferred.push(entry);
                continue;
            }

            let Ok(handle) = self.record(entry.id).await else {
                continue;
            };
            let mut record = handle.lock().await;
            if record.state() != GprState::Queued {
                continue;
            }

            let candidates = match self.candidate_clusters(&record).await {
                Ok(c) => c,
                Err(e) => {
                    error!(gpr_id = %entry.id, error = %e, "Failed to resolve candidate clusters");
                    record.last_error = Some(failure_of(&e));
                    deferred.push(entry);
                    continue;
                }
            };

            let generation = self.inventory.generation();
            if record.attempted_generation == Some(generation) {
                // Nothing freed since the last failure; keep waiting in place
                blocked.insert(band);
                add_debt(&mut debt, &candidates, record.request.total_gpus());
                deferred.push(entry);
                continue;
            }

            match self.selection.select(&record.request, &candidates, &debt).await {
                Ok(placement) => {
                    match record.apply(LifecycleEvent::Admitted(placement.clone()), Utc::now()) {
                        Ok(_) => {
                            record.last_error = None;
                            admitted += 1;
                        }
                        Err(e) => {
                            error!(gpr_id = %entry.id, error = %e, "Admission rejected");
                            self.selection.release(&record.request, &placement).await;
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    record.retry_count += 1;
                    record.attempted_generation = Some(generation);
                    record.last_error = Some(failure_of(&e));

                    if record.retry_count >= self.config.max_selection_retries {
                        warn!(
                            gpr_id = %entry.id,
                            retries = record.retry_count,
                            "Selection retries exhausted"
                        );
                        if let Err(e) = record.apply(
                            LifecycleEvent::SelectionExhausted(e.to_string()),
                            Utc::now(),
                        ) {
                            error!(gpr_id = %entry.id, error = %e, "Failed to fail GPR");
                        }
                        continue;
                    }

                    debug!(
                        gpr_id = %entry.id,
                        retries = record.retry_count,
                        "Insufficient capacity; GPR stays queued"
                    );
                    blocked.insert(band);
                    add_debt(&mut debt, &candidates, record.request.total_gpus());
                    deferred.push(entry);
                }
                Err(e) => {
                    error!(gpr_id = %entry.id, error = %e, "Selection failed");
                    record.last_error = Some(failure_of(&e));
                    deferred.push(entry);
                }
            }
        }

        for mut entry in deferred {
            let Ok(handle) = self.record(entry.id).await else {
                continue;
            };
            let record = handle.lock().await;
            if record.state() != GprState::Queued {
                continue;
            }
            entry.priority = record.request.priority;
            self.queue.restore(entry).await;
        }

        if admitted > 0 {
            self.resolver.refresh_status().await;
        }
        admitted
    }

    /// Return capacity and requeue according to a transition
    async fn settle(&self, record: &GprRecord, transition: &Transition) {
        if let Some(placement) = &transition.released {
            let gpus = self.selection.release(&record.request, placement).await;
            info!(
                gpr_id = %record.request.id,
                cluster = %placement.cluster_name,
                gpus = gpus,
                "Returned GPR capacity"
            );
        }
        if transition.requeued {
            self.queue.enqueue(&record.request).await;
        }
        if transition.released.is_some() || transition.requeued {
            self.resolver.refresh_status().await;
            self.wake.notify_one();
        }
    }

    /// Get a GPR snapshot
    pub async fn get_gpr(&self, id: GprId) -> EgsResult<GprSnapshot> {
        let handle = self.record(id).await?;
        let record = handle.lock().await;
        Ok(record.snapshot())
    }

    /// List a workspace's GPRs, oldest first
    pub async fn list_gprs(
        &self,
        credential: &Credential,
        workspace_name: &str,
    ) -> EgsResult<Vec<GprSnapshot>> {
        self.registry
            .workspace_clusters(credential, workspace_name)
            .await?;

        let handles: Vec<Arc<Mutex<GprRecord>>> =
            self.records.read().await.values().cloned().collect();

        let mut out = Vec::new();
        for handle in handles {
            let record = handle.lock().await;
            if record.request.workspace_name == workspace_name {
                out.push(record.snapshot());
            }
        }
        out.sort_by_key(|s| (s.created_at, s.id));
        Ok(out)
    }

    /// Release a GPR: cancel it if not yet running, complete it if running
    pub async fn release_gpr(&self, id: GprId) -> EgsResult<ReleaseOutcome> {
        let handle = self.record(id).await?;
        self.queue.cancel(id).await;

        // Waits for an in-flight admission to commit or abort
        let mut record = handle.lock().await;
        if record.state().is_terminal() {
            return Ok(ReleaseOutcome::AlreadyCompleted);
        }

        let transition = record.apply(LifecycleEvent::Release, Utc::now())?;
        self.settle(&record, &transition).await;

        info!(gpr_id = %id, state = %transition.to, "Released GPR");
        Ok(match transition.to {
            GprState::Cancelled => ReleaseOutcome::Cancelled,
            _ => ReleaseOutcome::Released,
        })
    }

    /// Cancel a GPR that has not started running
    pub async fn cancel_gpr(&self, id: GprId) -> EgsResult<GprSnapshot> {
        let handle = self.record(id).await?;
        {
            let record = handle.lock().await;
            if record.state() != GprState::Queued && record.state() != GprState::Provisioning {
                return Err(EgsError::Conflict(format!(
                    "GPR {} is {} and can only be released",
                    id,
                    record.state()
                )));
            }
        }
        self.queue.cancel(id).await;

        let mut record = handle.lock().await;
        let transition = record.apply(LifecycleEvent::Cancel, Utc::now())?;
        self.settle(&record, &transition).await;
        Ok(record.snapshot())
    }

    /// Change the priority of a queued GPR
    pub async fn update_gpr_priority(&self, id: GprId, priority: u32) -> EgsResult<GprSnapshot> {
        let handle = self.record(id).await?;
        let mut record = handle.lock().await;
        if record.state() != GprState::Queued {
            return Err(EgsError::Conflict(format!(
                "GPR {} is already provisioned",
                id
            )));
        }

        record.request.priority = priority;
        // Entries held back by a running dispatch pass pick the new
        // priority up when they are restored
        self.queue.reprioritize(id, priority).await;
        self.wake.notify_one();

        info!(gpr_id = %id, priority = priority, "Updated GPR priority");
        Ok(record.snapshot())
    }

    /// Rename a GPR
    pub async fn update_gpr_name(&self, id: GprId, name: &str) -> EgsResult<GprSnapshot> {
        if name.trim().is_empty() {
            return Err(EgsError::BadParameters("requestName is required".to_string()));
        }
        let handle = self.record(id).await?;
        let mut record = handle.lock().await;
        if record.state().is_terminal() {
            return Err(EgsError::Conflict(format!(
                "GPR {} is {}",
                id,
                record.state()
            )));
        }
        record.request.request_name = name.to_string();
        Ok(record.snapshot())
    }

    /// Apply a workload status signal from the orchestration layer
    pub async fn workload_signal(
        &self,
        id: GprId,
        signal: WorkloadSignal,
    ) -> EgsResult<GprSnapshot> {
        let event = match signal {
            WorkloadSignal::Active => LifecycleEvent::WorkloadActive,
            WorkloadSignal::Idle => LifecycleEvent::WorkloadIdle,
            WorkloadSignal::Failed { reason } => {
                warn!(gpr_id = %id, reason = %reason, "Workload failed");
                LifecycleEvent::WorkloadFailed(reason)
            }
        };

        let handle = self.record(id).await?;
        let mut record = handle.lock().await;
        let transition = record.apply(event, Utc::now())?;
        self.settle(&record, &transition).await;
        Ok(record.snapshot())
    }

    /// Enforce exit durations and idle timeouts, then purge expired terminal
    /// GPRs. Safe to run repeatedly for the same `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let handles: Vec<(GprId, Arc<Mutex<GprRecord>>)> = self
            .records
            .read()
            .await
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();

        let mut report = SweepReport::default();
        let mut expired = Vec::new();
        let retention = self.config.terminal_retention();

        for (id, handle) in handles {
            let mut record = handle.lock().await;

            // Exit expiry takes precedence over idle eviction
            let event = if record.exit_deadline().is_some_and(|d| d <= now) {
                Some(LifecycleEvent::ExitExpired)
            } else if record.idle_deadline().is_some_and(|d| d <= now) {
                Some(LifecycleEvent::IdleTimeout)
            } else {
                None
            };

            if let Some(event) = event {
                match record.apply(event, now) {
                    Ok(transition) if transition.changed() => {
                        match transition.to {
                            GprState::Complete => report.completed += 1,
                            _ => report.evicted += 1,
                        }
                        if transition.requeued {
                            report.requeued += 1;
                        }
                        self.settle(&record, &transition).await;
                    }
                    Ok(_) => {}
                    Err(e) => error!(gpr_id = %id, error = %e, "Sweep transition failed"),
                }
                continue;
            }

            let purge_at = record
                .completed_at
                .zip(retention)
                .and_then(|(at, keep)| at.checked_add_signed(keep));
            if record.state().is_terminal() && purge_at.is_some_and(|d| d <= now) {
                expired.push(id);
            }
        }

        if !expired.is_empty() {
            let mut records = self.records.write().await;
            for id in &expired {
                records.remove(id);
            }
            report.purged = expired.len();
        }

        if report != SweepReport::default() {
            info!(
                completed = report.completed,
                evicted = report.evicted,
                requeued = report.requeued,
                purged = report.purged,
                "Sweep finished"
            );
        }
        report
    }

    /// Apply an inventory feed event
    pub async fn apply_inventory(&self, event: InventoryEvent) {
        self.inventory.apply(event).await;
        self.resolver.refresh_status().await;
        self.wake.notify_one();
    }

    /// Replace a workspace's cluster membership. Queued GPRs of the
    /// workspace are reconsidered against the new candidate set.
    pub async fn update_workspace_clusters(
        &self,
        credential: &Credential,
        workspace_name: &str,
        clusters: Vec<String>,
    ) -> EgsResult<Vec<String>> {
        self.registry
            .set_workspace_clusters(credential, workspace_name, clusters)
            .await?;
        self.inventory.mark_changed();
        self.resolver.refresh_status().await;
        self.wake.notify_one();
        self.registry
            .workspace_clusters(credential, workspace_name)
            .await
    }

    /// Full inventory snapshot
    pub async fn inventory(&self) -> Vec<Cluster> {
        self.inventory.clusters().await
    }

    /// Capacity usage grouped by cluster, shape and instance type over the
    /// clusters a workspace can reach
    pub async fn workspace_inventory(
        &self,
        credential: &Credential,
        workspace_name: &str,
    ) -> EgsResult<Vec<InventoryUsage>> {
        let clusters = self
            .registry
            .workspace_clusters(credential, workspace_name)
            .await?;

        let mut usage: Vec<InventoryUsage> = Vec::new();
        for name in &clusters {
            let Some(cluster) = self.inventory.cluster(name).await else {
                continue;
            };
            for node in &cluster.nodes {
                let group = usage.iter_mut().find(|u| {
                    u.cluster_name == cluster.name
                        && u.gpu_shape == node.gpu_shape
                        && u.instance_type == node.instance_type
                });
                let available = if node.is_schedulable() {
                    node.available_gpu_count
                } else {
                    0
                };
                match group {
                    Some(u) => {
                        u.node_names.push(node.name.clone());
                        u.total_gpus += node.total_gpu_count;
                        u.available_gpus += available;
                    }
                    None => usage.push(InventoryUsage {
                        cluster_name: cluster.name.clone(),
                        node_names: vec![node.name.clone()],
                        gpu_shape: node.gpu_shape.clone(),
                        instance_type: node.instance_type.clone(),
                        memory_per_gpu_gb: node.memory_per_gpu_gb,
                        total_gpus: node.total_gpu_count,
                        available_gpus: available,
                    }),
                }
            }
        }
        Ok(usage)
    }

    /// Engine-wide counters
    pub async fn status(&self) -> SchedulerStatus {
        let handles: Vec<Arc<Mutex<GprRecord>>> =
            self.records.read().await.values().cloned().collect();
        let mut gprs_by_state = BTreeMap::new();
        for handle in handles {
            let state = handle.lock().await.state();
            *gprs_by_state.entry(state.to_string()).or_insert(0) += 1;
        }

        let clusters = self.inventory.clusters().await;
        SchedulerStatus {
            queued: self.queue.len().await,
            queued_by_workspace: self.queue.depth_by_workspace().await,
            gprs_by_state,
            clusters: clusters.len(),
            total_gpus: clusters
                .iter()
                .fold(0u32, |acc, c| acc.saturating_add(c.total_gpus())),
            available_gpus: clusters
                .iter()
                .fold(0u32, |acc, c| acc.saturating_add(c.available_gpus())),
        }
    }

    // Template and binding operations

    pub async fn create_template(&self, template: GprTemplate) -> EgsResult<GprTemplate> {
        let template = self.store.create_template(template).await?;
        self.resolver.refresh_status().await;
        Ok(template)
    }

    pub async fn get_template(&self, name: &str) -> EgsResult<GprTemplate> {
        self.store.get_template(name).await
    }

    pub async fn list_templates(&self) -> Vec<GprTemplate> {
        self.store.list_templates().await
    }

    pub async fn update_template(&self, template: GprTemplate) -> EgsResult<GprTemplate> {
        let template = self.store.update_template(template).await?;
        self.resolver.refresh_status().await;
        Ok(template)
    }

    pub async fn delete_template(&self, name: &str) -> EgsResult<()> {
        self.store.delete_template(name).await
    }

    /// Bound clusters must be reachable from the workspace
    async fn check_binding_clusters(
        &self,
        credential: &Credential,
        binding: &GprTemplateBinding,
    ) -> EgsResult<()> {
        let reachable = self
            .registry
            .workspace_clusters(credential, &binding.workspace_name)
            .await?;
        if let Some(c) = binding
            .clusters
            .iter()
            .find(|c| !reachable.contains(&c.cluster_name))
        {
            return Err(EgsError::BadParameters(format!(
                "cluster '{}' is not bound to workspace '{}'",
                c.cluster_name, binding.workspace_name
            )));
        }
        Ok(())
    }

    pub async fn create_template_binding(
        &self,
        credential: &Credential,
        binding: GprTemplateBinding,
    ) -> EgsResult<GprTemplateBinding> {
        self.check_binding_clusters(credential, &binding).await?;
        let workspace = binding.workspace_name.clone();
        self.store.create_binding(binding).await?;
        self.resolver.refresh_status().await;
        self.store.get_binding(&workspace).await
    }

    pub async fn get_template_binding(&self, workspace_name: &str) -> EgsResult<GprTemplateBinding> {
        self.store.get_binding(workspace_name).await
    }

    pub async fn list_template_bindings(&self) -> Vec<GprTemplateBinding> {
        self.store.list_bindings().await
    }

    pub async fn update_template_binding(
        &self,
        credential: &Credential,
        binding: GprTemplateBinding,
    ) -> EgsResult<GprTemplateBinding> {
        self.check_binding_clusters(credential, &binding).await?;
        let workspace = binding.workspace_name.clone();
        self.store.update_binding(binding).await?;
        self.resolver.refresh_status().await;
        self.store.get_binding(&workspace).await
    }

    pub async fn delete_template_binding(&self, workspace_name: &str) -> EgsResult<()> {
        self.store.delete_binding(workspace_name).await
    }

    // Background loops

    /// Admit queued GPRs whenever requests arrive or capacity frees up
    pub async fn run_dispatcher(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        info!("Dispatcher started");
        loop {
            let admitted = self.dispatch_once().await;
            if admitted > 0 {
                debug!(admitted = admitted, "Dispatch pass finished");
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = shutdown_rx.changed() => {
                    info!("Dispatcher shutting down");
                    break;
                }
            }
        }
    }

    /// Periodic idle-timeout and exit-duration sweep
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        info!(interval_secs = self.config.sweep_interval().as_secs(), "Sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
                _ = shutdown_rx.changed() => {
                    info!("Sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// Consume inventory feed events until the channel closes or shutdown
    pub async fn run_inventory_feed(
        self: Arc<Self>,
        mut events: mpsc::Receiver<InventoryEvent>,
        mut shutdown_rx: watch::Receiver<()>,
    ) {
        info!("Inventory feed started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.apply_inventory(event).await,
                        None => {
                            info!("Inventory feed closed");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Inventory feed shutting down");
                    break;
                }
            }
        }
    }
}
