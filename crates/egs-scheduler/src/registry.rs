//! Workspace/cluster registry collaborator

use async_trait::async_trait;
use egs_core::{Credential, EgsError, EgsResult, WorkspaceConfig};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// Source of the clusters each workspace may reach
#[async_trait]
pub trait WorkspaceRegistry: Send + Sync {
    /// Clusters bound to a workspace, in declaration order
    async fn workspace_clusters(
        &self,
        credential: &Credential,
        workspace_name: &str,
    ) -> EgsResult<Vec<String>>;

    /// Replace the clusters bound to a workspace. Read-only registries keep
    /// the default, which refuses.
    async fn set_workspace_clusters(
        &self,
        _credential: &Credential,
        workspace_name: &str,
        _clusters: Vec<String>,
    ) -> EgsResult<()> {
        Err(EgsError::Conflict(format!(
            "workspace '{}' membership is managed externally",
            workspace_name
        )))
    }
}

/// Registry backed by static configuration
#[derive(Debug, Default)]
pub struct StaticRegistry {
    workspaces: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticRegistry {
    pub fn from_config(workspaces: &[WorkspaceConfig]) -> Self {
        let map = workspaces
            .iter()
            .map(|w| (w.name.clone(), w.clusters.clone()))
            .collect();
        Self {
            workspaces: RwLock::new(map),
        }
    }
}

#[async_trait]
impl WorkspaceRegistry for StaticRegistry {
    async fn workspace_clusters(
        &self,
        _credential: &Credential,
        workspace_name: &str,
    ) -> EgsResult<Vec<String>> {
        self.workspaces
            .read()
            .await
            .get(workspace_name)
            .cloned()
            .ok_or_else(|| EgsError::ResourceNotFound(format!("workspace '{}'", workspace_name)))
    }

    async fn set_workspace_clusters(
        &self,
        _credential: &Credential,
        workspace_name: &str,
        clusters: Vec<String>,
    ) -> EgsResult<()> {
        if workspace_name.trim().is_empty() {
            return Err(EgsError::BadParameters("workspace name is required".to_string()));
        }
        if let Some(blank) = clusters.iter().find(|c| c.trim().is_empty()) {
            return Err(EgsError::BadParameters(format!(
                "invalid cluster name '{}'",
                blank
            )));
        }
        info!(workspace = %workspace_name, clusters = ?clusters, "Workspace clusters updated");
        self.workspaces
            .write()
            .await
            .insert(workspace_name.to_string(), clusters);
        Ok(())
    }
}
