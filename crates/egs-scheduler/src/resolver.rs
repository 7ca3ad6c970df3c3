//! Template resolution and binding status projection

use egs_core::{Cluster, EgsError, EgsResult, GprTemplate, TemplateStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::inventory_index::InventoryIndex;
use crate::store::TemplateStore;

/// A template chosen for a request, with the cluster it was resolved for
#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    pub cluster_name: String,
    pub template: GprTemplate,
}

/// Maps a workspace and optional shape to a concrete template
pub struct TemplateResolver {
    store: Arc<TemplateStore>,
    inventory: Arc<InventoryIndex>,
}

impl TemplateResolver {
    pub fn new(store: Arc<TemplateStore>, inventory: Arc<InventoryIndex>) -> Self {
        Self { store, inventory }
    }

    /// Resolve a template by name. The template must exist and, when
    /// clusters are given, be scoped to one of them.
    pub async fn resolve_named(
        &self,
        template_name: &str,
        clusters: &[String],
    ) -> EgsResult<ResolvedTemplate> {
        let template = self.store.get_template(template_name).await?;
        if !clusters.is_empty() && !clusters.contains(&template.cluster_name) {
            return Err(EgsError::BadParameters(format!(
                "template '{}' is scoped to cluster '{}', which is not among the requested clusters",
                template_name, template.cluster_name
            )));
        }
        Ok(ResolvedTemplate {
            cluster_name: template.cluster_name.clone(),
            template,
        })
    }

    /// Auto-resolve a template from the workspace binding.
    ///
    /// Returns `Ok(None)` when the workspace has no binding or auto-GPR is
    /// disabled. Binding clusters are visited in declaration order, limited
    /// to `clusters` when it is non-empty. Within a cluster the default
    /// template wins if its shape has free capacity, otherwise the first
    /// listed template that does.
    pub async fn resolve_auto(
        &self,
        workspace_name: &str,
        desired_shape: Option<&str>,
        clusters: &[String],
    ) -> EgsResult<Option<ResolvedTemplate>> {
        let Some(binding) = self.store.binding(workspace_name).await else {
            return Ok(None);
        };
        if !binding.enable_auto_gpr {
            return Ok(None);
        }

        for entry in &binding.clusters {
            if !clusters.is_empty() && !clusters.contains(&entry.cluster_name) {
                continue;
            }
            let Some(cluster) = self.inventory.cluster(&entry.cluster_name).await else {
                continue;
            };

            let candidates = std::iter::once(&entry.default_template_name)
                .chain(entry.templates.iter().filter(|t| **t != entry.default_template_name));

            for name in candidates {
                let Ok(template) = self.store.get_template(name).await else {
                    continue;
                };
                if desired_shape.is_some_and(|shape| shape != template.gpu_shape) {
                    continue;
                }
                if cluster.has_capacity_for_shape(&template.gpu_shape) {
                    debug!(
                        workspace = %workspace_name,
                        cluster = %entry.cluster_name,
                        template = %template.name,
                        "Resolved GPR template"
                    );
                    return Ok(Some(ResolvedTemplate {
                        cluster_name: entry.cluster_name.clone(),
                        template,
                    }));
                }
            }
        }

        Err(EgsError::NoTemplateAvailable(format!(
            "no bound template of workspace '{}' has free capacity",
            workspace_name
        )))
    }

    /// Recompute `defaultTemplateStatus` and `templateStatus` for every binding
    pub async fn refresh_status(&self) {
        let clusters: BTreeMap<String, Cluster> = self
            .inventory
            .clusters()
            .await
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        let templates: BTreeMap<String, GprTemplate> = self
            .store
            .list_templates()
            .await
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();

        self.store
            .for_each_binding_mut(|binding| {
                for entry in &mut binding.clusters {
                    let cluster = clusters.get(&entry.cluster_name);
                    entry.template_status = entry
                        .templates
                        .iter()
                        .map(|name| {
                            let status = template_status(
                                templates.get(name),
                                &entry.cluster_name,
                                cluster,
                            );
                            (name.clone(), status)
                        })
                        .collect();
                    entry.default_template_status =
                        entry.template_status.get(&entry.default_template_name).copied();
                }
            })
            .await;
    }
}

fn template_status(
    template: Option<&GprTemplate>,
    cluster_name: &str,
    cluster: Option<&Cluster>,
) -> TemplateStatus {
    let Some(template) = template.filter(|t| t.cluster_name == cluster_name) else {
        return TemplateStatus::TemplateNotFound;
    };
    match cluster {
        Some(c) if c.has_capacity_for_shape(&template.gpu_shape) => TemplateStatus::Available,
        _ => TemplateStatus::NoCapacity,
    }
}
