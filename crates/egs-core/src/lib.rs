//! egs-core: Core types for the GPU request (GPR) engine
//!
//! This crate provides the fundamental types used throughout the engine:
//! - GPU requests, their lifecycle states and snapshots
//! - GPR templates and workspace template bindings
//! - Cluster and node inventory records
//! - Configuration types
//! - Error handling

pub mod config;
pub mod credential;
pub mod duration;
pub mod error;
pub mod gpr;
pub mod inventory;
pub mod template;

pub use config::*;
pub use credential::Credential;
pub use duration::GprDuration;
pub use error::*;
pub use gpr::*;
pub use inventory::*;
pub use template::*;
