//! GPR lifecycle state machine

use chrono::{DateTime, Utc};
use egs_core::{
    Credential, EgsError, EgsResult, ErrorKind, FailureInfo, GprSnapshot, GprState, GpuRequest,
    Placement,
};
use tracing::{info, warn};

/// Event driving a GPR transition
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Selection reserved capacity
    Admitted(Placement),
    /// Workload attached to the GPR reports activity
    WorkloadActive,
    /// Workload reports no activity; the idle clock keeps running
    WorkloadIdle,
    /// Workload failed to provision or crashed
    WorkloadFailed(String),
    /// Selection retries ran out
    SelectionExhausted(String),
    /// Explicit cancel
    Cancel,
    /// Explicit release
    Release,
    /// Idle timeout elapsed
    IdleTimeout,
    /// Exit duration elapsed
    ExitExpired,
}

/// Result of applying an event
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: GprState,
    pub to: GprState,
    /// Capacity the caller must return to the inventory
    pub released: Option<Placement>,
    /// The GPR passed through a requeueable terminal state back to Queued
    pub requeued: bool,
}

impl Transition {
    fn stay(state: GprState) -> Self {
        Self {
            from: state,
            to: state,
            released: None,
            requeued: false,
        }
    }

    pub fn changed(&self) -> bool {
        self.from != self.to || self.requeued
    }
}

/// A GPR together with everything the scheduler tracks about it
#[derive(Debug, Clone)]
pub struct GprRecord {
    pub request: GpuRequest,
    /// Caller's credential, passed through to collaborators
    pub credential: Credential,
    pub placement: Option<Placement>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Selection attempts that hit insufficient capacity since last queued
    pub retry_count: u32,
    /// Inventory generation of the last failed selection attempt
    pub attempted_generation: Option<u64>,
    pub requeue_count: u32,
    pub failure: Option<FailureInfo>,
    pub last_error: Option<FailureInfo>,
}

impl GprRecord {
    pub fn new(request: GpuRequest, credential: Credential) -> Self {
        Self {
            request,
            credential,
            placement: None,
            provisioned_at: None,
            started_at: None,
            last_activity_at: None,
            completed_at: None,
            retry_count: 0,
            attempted_generation: None,
            requeue_count: 0,
            failure: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> GprState {
        self.request.state
    }

    /// When the exit duration forces completion
    pub fn exit_deadline(&self) -> Option<DateTime<Utc>> {
        if self.state() != GprState::Running {
            return None;
        }
        self.started_at?
            .checked_add_signed(self.request.exit_duration.as_chrono()?)
    }

    /// When the idle timeout evicts the GPR
    pub fn idle_deadline(&self) -> Option<DateTime<Utc>> {
        if self.state() != GprState::Running || !self.request.enforce_idle_timeout {
            return None;
        }
        let timeout = self.request.idle_timeout_duration?.as_chrono()?;
        self.last_activity_at?.checked_add_signed(timeout)
    }

    /// Apply an event at time `now`.
    ///
    /// Invalid transitions are `Conflict` and leave the record untouched.
    /// Sweep events on a GPR that is no longer running are no-ops.
    pub fn apply(&mut self, event: LifecycleEvent, now: DateTime<Utc>) -> EgsResult<Transition> {
        let from = self.state();
        let transition = match (from, event) {
            (GprState::Queued, LifecycleEvent::Admitted(placement)) => {
                self.placement = Some(placement);
                self.provisioned_at = Some(now);
                self.enter(GprState::Provisioning)
            }

            (GprState::Provisioning, LifecycleEvent::WorkloadActive) => {
                self.started_at = Some(now);
                self.last_activity_at = Some(now);
                self.enter(GprState::Running)
            }
            (GprState::Running, LifecycleEvent::WorkloadActive) => {
                self.last_activity_at = Some(now);
                Transition::stay(from)
            }
            (GprState::Provisioning | GprState::Running, LifecycleEvent::WorkloadIdle) => {
                Transition::stay(from)
            }

            (GprState::Provisioning | GprState::Running, LifecycleEvent::WorkloadFailed(reason)) => {
                let failure = FailureInfo {
                    kind: ErrorKind::UnhandledException,
                    reason,
                };
                self.failure = Some(failure.clone());
                self.last_error = Some(failure);
                let requeue = self.request.requeue_on_failure;
                self.finish(GprState::Failed, requeue, now)
            }

            (GprState::Queued, LifecycleEvent::SelectionExhausted(reason)) => {
                self.failure = Some(FailureInfo {
                    kind: ErrorKind::InsufficientCapacity,
                    reason,
                });
                self.finish(GprState::Failed, false, now)
            }

            (
                GprState::Queued | GprState::Provisioning,
                LifecycleEvent::Cancel | LifecycleEvent::Release,
            ) => self.finish(GprState::Cancelled, false, now),

            (GprState::Running, LifecycleEvent::Release | LifecycleEvent::ExitExpired) => {
                self.finish(GprState::Complete, false, now)
            }

            (GprState::Running, LifecycleEvent::IdleTimeout) => {
                let requeue = self.request.enable_eviction;
                self.finish(GprState::IdleEvicted, requeue, now)
            }

            (_, LifecycleEvent::IdleTimeout | LifecycleEvent::ExitExpired) => {
                Transition::stay(from)
            }
            (state, LifecycleEvent::Release) if state.is_terminal() => Transition::stay(from),

            (state, event) => {
                return Err(EgsError::Conflict(format!(
                    "GPR {} cannot handle {} while {}",
                    self.request.id,
                    event_name(&event),
                    state
                )));
            }
        };
        Ok(transition)
    }

    fn enter(&mut self, to: GprState) -> Transition {
        let from = self.state();
        self.request.state = to;
        info!(
            gpr_id = %self.request.id,
            workspace = %self.request.workspace_name,
            from = %from,
            to = %to,
            "GPR state transition"
        );
        Transition {
            from,
            to,
            released: None,
            requeued: false,
        }
    }

    /// Move to a terminal state, handing back held capacity. With `requeue`
    /// the GPR immediately re-enters Queued with its id, priority and
    /// creation time intact.
    fn finish(&mut self, terminal: GprState, requeue: bool, now: DateTime<Utc>) -> Transition {
        let from = self.state();
        let released = self.placement.take();
        self.request.state = terminal;
        self.completed_at = Some(now);
        info!(
            gpr_id = %self.request.id,
            workspace = %self.request.workspace_name,
            from = %from,
            to = %terminal,
            "GPR state transition"
        );

        if !requeue {
            return Transition {
                from,
                to: terminal,
                released,
                requeued: false,
            };
        }

        self.request.state = GprState::Queued;
        self.provisioned_at = None;
        self.started_at = None;
        self.last_activity_at = None;
        self.completed_at = None;
        self.failure = None;
        self.retry_count = 0;
        self.attempted_generation = None;
        self.requeue_count += 1;
        warn!(
            gpr_id = %self.request.id,
            via = %terminal,
            requeue_count = self.requeue_count,
            priority = self.request.priority,
            "Requeued GPR"
        );

        Transition {
            from,
            to: GprState::Queued,
            released,
            requeued: true,
        }
    }

    /// Read-only view for callers
    pub fn snapshot(&self) -> GprSnapshot {
        let placement = self.placement.as_ref();
        let nodes: Vec<String> = placement
            .map(|p| p.nodes.iter().map(|n| n.node_name.clone()).collect())
            .unwrap_or_default();

        GprSnapshot {
            id: self.request.id,
            request_name: self.request.request_name.clone(),
            workspace_name: self.request.workspace_name.clone(),
            state: self.request.state,
            selection: self.request.selection,
            cluster: placement.map(|p| p.cluster_name.clone()),
            node: nodes.first().cloned(),
            nodes,
            gpu_shape: placement
                .map(|p| p.gpu_shape.clone())
                .or_else(|| self.request.gpu_shape_constraint.clone()),
            instance_type: placement
                .map(|p| p.instance_type.clone())
                .or_else(|| self.request.instance_type_constraint.clone()),
            priority: self.request.priority,
            num_gpus_allocated: placement.map(|p| p.total_gpus()).unwrap_or(0),
            exit_duration: self.request.exit_duration,
            created_at: self.request.created_at,
            provisioned_at: self.provisioned_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            retry_count: self.retry_count,
            requeue_count: self.requeue_count,
            failure: self.failure.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

fn event_name(event: &LifecycleEvent) -> &'static str {
    match event {
        LifecycleEvent::Admitted(_) => "admission",
        LifecycleEvent::WorkloadActive => "workload-active",
        LifecycleEvent::WorkloadIdle => "workload-idle",
        LifecycleEvent::WorkloadFailed(_) => "workload-failed",
        LifecycleEvent::SelectionExhausted(_) => "selection-exhausted",
        LifecycleEvent::Cancel => "cancel",
        LifecycleEvent::Release => "release",
        LifecycleEvent::IdleTimeout => "idle-timeout",
        LifecycleEvent::ExitExpired => "exit-expiry",
    }
}
