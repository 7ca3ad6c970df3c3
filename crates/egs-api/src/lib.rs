//! egs-api: REST API for the GPR engine
//!
//! This crate exposes the engine over HTTP:
//! - GPR create, query, release, cancel and edits
//! - Template and template binding CRUD
//! - Inventory views and feed ingestion
//! - Engine status

pub mod rest;

pub use rest::{create_router, create_router_with_feed};
