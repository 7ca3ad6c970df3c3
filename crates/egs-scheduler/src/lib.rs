//! egs-scheduler: GPU request admission and lifecycle orchestration
//!
//! This crate decides which cluster and GPUs satisfy a request and drives the
//! request through its lifecycle:
//! - Inventory index with per-node reservation accounting
//! - Template and binding store, and template resolution
//! - Selection across clusters and nodes
//! - Priority admission queue
//! - Lifecycle state machine, idle eviction and requeue
//! - The scheduler facade and its background loops

pub mod inventory_index;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod selection;
pub mod store;

pub use inventory_index::InventoryIndex;
pub use lifecycle::{GprRecord, LifecycleEvent, Transition};
pub use queue::AdmissionQueue;
pub use registry::{StaticRegistry, WorkspaceRegistry};
pub use resolver::{ResolvedTemplate, TemplateResolver};
pub use scheduler::{GprScheduler, SchedulerStatus, SweepReport};
pub use selection::{LeastLoadedStrategy, PlacementStrategy, SelectionEngine};
pub use store::TemplateStore;
