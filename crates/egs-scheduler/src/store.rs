//! Template and template-binding records

use egs_core::{EgsError, EgsResult, GprTemplate, GprTemplateBinding};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::info;

/// Directly mutable store of GPR templates and workspace bindings.
///
/// Lock order is templates before bindings whenever both are held.
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: RwLock<BTreeMap<String, GprTemplate>>,
    bindings: RwLock<BTreeMap<String, GprTemplateBinding>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a template
    pub async fn create_template(&self, template: GprTemplate) -> EgsResult<GprTemplate> {
        template.validate()?;
        let mut templates = self.templates.write().await;
        if templates.contains_key(&template.name) {
            return Err(EgsError::Conflict(format!(
                "template '{}' already exists",
                template.name
            )));
        }

        info!(
            template = %template.name,
            cluster = %template.cluster_name,
            gpu_shape = %template.gpu_shape,
            "Created GPR template"
        );
        templates.insert(template.name.clone(), template.clone());
        Ok(template)
    }

    /// Get a template by name
    pub async fn get_template(&self, name: &str) -> EgsResult<GprTemplate> {
        self.templates
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EgsError::ResourceNotFound(format!("template '{}'", name)))
    }

    /// List all templates ordered by name
    pub async fn list_templates(&self) -> Vec<GprTemplate> {
        self.templates.read().await.values().cloned().collect()
    }

    /// Replace a template. Referenced templates are immutable.
    pub async fn update_template(&self, template: GprTemplate) -> EgsResult<GprTemplate> {
        template.validate()?;
        let mut templates = self.templates.write().await;
        if !templates.contains_key(&template.name) {
            return Err(EgsError::ResourceNotFound(format!(
                "template '{}'",
                template.name
            )));
        }
        self.ensure_unreferenced(&template.name).await?;

        info!(template = %template.name, "Updated GPR template");
        templates.insert(template.name.clone(), template.clone());
        Ok(template)
    }

    /// Delete a template. Fails while any binding references it.
    pub async fn delete_template(&self, name: &str) -> EgsResult<()> {
        let mut templates = self.templates.write().await;
        if !templates.contains_key(name) {
            return Err(EgsError::ResourceNotFound(format!("template '{}'", name)));
        }
        self.ensure_unreferenced(name).await?;

        templates.remove(name);
        info!(template = %name, "Deleted GPR template");
        Ok(())
    }

    async fn ensure_unreferenced(&self, name: &str) -> EgsResult<()> {
        let bindings = self.bindings.read().await;
        if let Some(binding) = bindings.values().find(|b| b.references(name)) {
            return Err(EgsError::Conflict(format!(
                "template '{}' is referenced by the binding of workspace '{}'",
                name, binding.workspace_name
            )));
        }
        Ok(())
    }

    /// Every referenced template must exist and be scoped to its cluster
    fn check_references(
        templates: &BTreeMap<String, GprTemplate>,
        binding: &GprTemplateBinding,
    ) -> EgsResult<()> {
        for cluster in &binding.clusters {
            for name in &cluster.templates {
                let template = templates.get(name).ok_or_else(|| {
                    EgsError::ResourceNotFound(format!("template '{}'", name))
                })?;
                if template.cluster_name != cluster.cluster_name {
                    return Err(EgsError::BadParameters(format!(
                        "template '{}' is scoped to cluster '{}', not '{}'",
                        name, template.cluster_name, cluster.cluster_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Create the binding for a workspace
    pub async fn create_binding(
        &self,
        mut binding: GprTemplateBinding,
    ) -> EgsResult<GprTemplateBinding> {
        binding.validate()?;
        binding.clear_status();

        let templates = self.templates.read().await;
        Self::check_references(&templates, &binding)?;

        let mut bindings = self.bindings.write().await;
        if bindings.contains_key(&binding.workspace_name) {
            return Err(EgsError::Conflict(format!(
                "workspace '{}' already has a template binding",
                binding.workspace_name
            )));
        }

        info!(
            workspace = %binding.workspace_name,
            clusters = binding.clusters.len(),
            enable_auto_gpr = binding.enable_auto_gpr,
            "Created GPR template binding"
        );
        bindings.insert(binding.workspace_name.clone(), binding.clone());
        Ok(binding)
    }

    /// Get the binding for a workspace
    pub async fn get_binding(&self, workspace_name: &str) -> EgsResult<GprTemplateBinding> {
        self.binding(workspace_name).await.ok_or_else(|| {
            EgsError::ResourceNotFound(format!("template binding for '{}'", workspace_name))
        })
    }

    /// Binding for a workspace, if one exists
    pub async fn binding(&self, workspace_name: &str) -> Option<GprTemplateBinding> {
        self.bindings.read().await.get(workspace_name).cloned()
    }

    /// List all bindings ordered by workspace
    pub async fn list_bindings(&self) -> Vec<GprTemplateBinding> {
        self.bindings.read().await.values().cloned().collect()
    }

    /// Replace a workspace binding in place
    pub async fn update_binding(
        &self,
        mut binding: GprTemplateBinding,
    ) -> EgsResult<GprTemplateBinding> {
        binding.validate()?;
        binding.clear_status();

        let templates = self.templates.read().await;
        Self::check_references(&templates, &binding)?;

        let mut bindings = self.bindings.write().await;
        if !bindings.contains_key(&binding.workspace_name) {
            return Err(EgsError::ResourceNotFound(format!(
                "template binding for '{}'",
                binding.workspace_name
            )));
        }

        info!(workspace = %binding.workspace_name, "Updated GPR template binding");
        bindings.insert(binding.workspace_name.clone(), binding.clone());
        Ok(binding)
    }

    /// Delete a workspace binding
    pub async fn delete_binding(&self, workspace_name: &str) -> EgsResult<()> {
        if self.bindings.write().await.remove(workspace_name).is_none() {
            return Err(EgsError::ResourceNotFound(format!(
                "template binding for '{}'",
                workspace_name
            )));
        }
        info!(workspace = %workspace_name, "Deleted GPR template binding");
        Ok(())
    }

    /// Apply a function to every binding, used for status projection
    pub(crate) async fn for_each_binding_mut<F>(&self, mut f: F)
    where
        F: FnMut(&mut GprTemplateBinding),
    {
        let mut bindings = self.bindings.write().await;
        for binding in bindings.values_mut() {
            f(binding);
        }
    }
}
