//! Writes binding metadata and status.

use async_trait::async_trait;
use bindings_controller_core::{BindingId, BindingKind};
use bindings_controller_k8s_api::{
    Api, ApiResource, BindingStatus, Client, DynamicObject, EnvBinding, Patch, PatchParams,
    SecretBinding,
};

#[async_trait]
pub trait BindingWriter: Send + Sync + 'static {
    /// Replaces the binding's finalizers. When a resource version is given
    /// the write fails if the binding has changed since it was read.
    async fn patch_finalizers(
        &self,
        id: &BindingId,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error>;

    async fn patch_status(&self, id: &BindingId, status: &BindingStatus)
        -> Result<(), kube::Error>;
}

#[derive(Clone)]
pub struct KubeBindings {
    client: Client,
    params: PatchParams,
}

// === impl KubeBindings ===

impl KubeBindings {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            params: PatchParams {
                field_manager: Some(field_manager.into()),
                ..Default::default()
            },
        }
    }

    fn api(&self, id: &BindingId) -> Api<DynamicObject> {
        let resource = match id.kind {
            BindingKind::Secret => ApiResource::erase::<SecretBinding>(&()),
            BindingKind::Env => ApiResource::erase::<EnvBinding>(&()),
        };
        Api::namespaced_with(self.client.clone(), &id.namespace, &resource)
    }
}

#[async_trait]
impl BindingWriter for KubeBindings {
    async fn patch_finalizers(
        &self,
        id: &BindingId,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error> {
        let mut metadata = serde_json::json!({ "finalizers": finalizers });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = rv.into();
        }
        let patch = serde_json::json!({ "metadata": metadata });
        self.api(id)
            .patch(&id.name, &self.params, &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        id: &BindingId,
        status: &BindingStatus,
    ) -> Result<(), kube::Error> {
        let patch = serde_json::json!({ "status": status });
        self.api(id)
            .patch_status(&id.name, &self.params, &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
