//! GPR templates and workspace template bindings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{EgsError, EgsResult, GprDuration};

/// A named, reusable set of GPR defaults scoped to one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GprTemplate {
    pub name: String,
    pub cluster_name: String,
    pub gpu_per_node_count: u32,
    pub num_gpu_nodes: u32,
    /// Memory per GPU in GB
    pub memory_per_gpu: u32,
    pub gpu_shape: String,
    pub instance_type: String,
    pub exit_duration: GprDuration,
    pub priority: u32,
    #[serde(default)]
    pub enforce_idle_timeout: bool,
    #[serde(default)]
    pub idle_timeout_duration: Option<GprDuration>,
    #[serde(default)]
    pub enable_eviction: bool,
    #[serde(default)]
    pub requeue_on_failure: bool,
}

impl GprTemplate {
    /// Validate the template's own fields
    pub fn validate(&self) -> EgsResult<()> {
        if self.name.trim().is_empty() {
            return Err(EgsError::BadParameters("template name is required".to_string()));
        }
        if self.cluster_name.trim().is_empty() {
            return Err(EgsError::BadParameters(format!(
                "template '{}' has no cluster",
                self.name
            )));
        }
        if self.gpu_per_node_count == 0 || self.num_gpu_nodes == 0 {
            return Err(EgsError::BadParameters(format!(
                "template '{}' must request at least one GPU on one node",
                self.name
            )));
        }
        if self.gpu_shape.trim().is_empty() {
            return Err(EgsError::BadParameters(format!(
                "template '{}' has no GPU shape",
                self.name
            )));
        }
        if self.exit_duration.is_zero() {
            return Err(EgsError::BadParameters(format!(
                "template '{}' has a zero exit duration",
                self.name
            )));
        }
        if self.enforce_idle_timeout && self.idle_timeout_duration.is_none() {
            return Err(EgsError::BadParameters(format!(
                "template '{}': idle_timeout_duration is required when enforce_idle_timeout is set",
                self.name
            )));
        }
        Ok(())
    }
}

/// Projection of whether a bound template can currently be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateStatus {
    Available,
    NoCapacity,
    TemplateNotFound,
}

impl std::fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateStatus::Available => write!(f, "Available"),
            TemplateStatus::NoCapacity => write!(f, "NoCapacity"),
            TemplateStatus::TemplateNotFound => write!(f, "TemplateNotFound"),
        }
    }
}

/// Templates bound to a workspace for one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingCluster {
    pub cluster_name: String,
    pub default_template_name: String,
    /// Fallback order for auto-resolution
    pub templates: Vec<String>,
    /// Eventually-consistent status projection; ignored on input
    #[serde(default)]
    pub default_template_status: Option<TemplateStatus>,
    #[serde(default)]
    pub template_status: BTreeMap<String, TemplateStatus>,
}

impl BindingCluster {
    pub fn new(cluster_name: &str, default_template_name: &str, templates: &[&str]) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            default_template_name: default_template_name.to_string(),
            templates: templates.iter().map(|t| t.to_string()).collect(),
            default_template_status: None,
            template_status: BTreeMap::new(),
        }
    }
}

/// The association of templates to a workspace. One per workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GprTemplateBinding {
    pub workspace_name: String,
    #[serde(rename = "enableAutoGPR", alias = "enableAutoGpr")]
    pub enable_auto_gpr: bool,
    pub clusters: Vec<BindingCluster>,
}

impl GprTemplateBinding {
    /// Structural validation; template existence is checked by the store
    pub fn validate(&self) -> EgsResult<()> {
        if self.workspace_name.trim().is_empty() {
            return Err(EgsError::BadParameters("binding workspace name is required".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if !seen.insert(cluster.cluster_name.as_str()) {
                return Err(EgsError::BadParameters(format!(
                    "cluster '{}' bound twice",
                    cluster.cluster_name
                )));
            }
            if !cluster.templates.contains(&cluster.default_template_name) {
                return Err(EgsError::BadParameters(format!(
                    "default template '{}' is not listed in templates for cluster '{}'",
                    cluster.default_template_name, cluster.cluster_name
                )));
            }
        }
        Ok(())
    }

    /// Whether any cluster entry references the template
    pub fn references(&self, template_name: &str) -> bool {
        self.clusters
            .iter()
            .any(|c| c.templates.iter().any(|t| t == template_name))
    }

    /// Strip the status projection from caller-supplied input
    pub fn clear_status(&mut self) {
        for cluster in &mut self.clusters {
            cluster.default_template_status = None;
            cluster.template_status.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str, cluster: &str, shape: &str) -> GprTemplate {
        GprTemplate {
            name: name.to_string(),
            cluster_name: cluster.to_string(),
            gpu_per_node_count: 1,
            num_gpu_nodes: 1,
            memory_per_gpu: 40,
            gpu_shape: shape.to_string(),
            instance_type: "a2-highgpu-2g".to_string(),
            exit_duration: "5m".parse().unwrap(),
            priority: 201,
            enforce_idle_timeout: true,
            idle_timeout_duration: Some("2m".parse().unwrap()),
            enable_eviction: true,
            requeue_on_failure: true,
        }
    }

    #[test]
    fn test_template_requires_idle_duration() {
        let mut t = template("t1", "worker-1", "A100");
        assert!(t.validate().is_ok());
        t.idle_timeout_duration = None;
        assert!(matches!(t.validate(), Err(EgsError::BadParameters(_))));
    }

    #[test]
    fn test_binding_default_must_be_listed() {
        let binding = GprTemplateBinding {
            workspace_name: "team-a".to_string(),
            enable_auto_gpr: true,
            clusters: vec![BindingCluster::new("worker-1", "t3", &["t1", "t2"])],
        };
        assert!(matches!(binding.validate(), Err(EgsError::BadParameters(_))));
    }

    #[test]
    fn test_binding_references() {
        let binding = GprTemplateBinding {
            workspace_name: "team-a".to_string(),
            enable_auto_gpr: true,
            clusters: vec![BindingCluster::new("worker-1", "t1", &["t1", "t2"])],
        };
        assert!(binding.validate().is_ok());
        assert!(binding.references("t2"));
        assert!(!binding.references("t9"));
    }

    #[test]
    fn test_binding_wire_names() {
        let json = r#"{
            "workspaceName": "team-a",
            "enableAutoGPR": true,
            "clusters": [{"clusterName": "worker-1", "defaultTemplateName": "t1", "templates": ["t1"]}]
        }"#;
        let binding: GprTemplateBinding = serde_json::from_str(json).unwrap();
        assert!(binding.enable_auto_gpr);
        assert_eq!(binding.clusters[0].default_template_name, "t1");
    }
}
