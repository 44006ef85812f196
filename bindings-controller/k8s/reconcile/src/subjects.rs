//! Locates and patches the workloads that bindings target.

use async_trait::async_trait;
use bindings_controller_k8s_api::{
    Api, ApiResource, Client, DynamicObject, ListParams, Patch, PatchParams, PodSpecable,
    Selector,
};

/// Reads and patches subject resources of any kind exposing a pod template.
#[async_trait]
pub trait Subjects: Send + Sync + 'static {
    /// Fetches a single subject, returning `None` if it does not exist.
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodSpecable>, kube::Error>;

    /// Lists the subjects in a namespace matching a label selector.
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PodSpecable>, kube::Error>;

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<(), kube::Error>;
}

/// Accesses subjects through the dynamic Kubernetes API.
#[derive(Clone)]
pub struct KubeSubjects {
    client: Client,
    params: PatchParams,
}

// === impl KubeSubjects ===

impl KubeSubjects {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            params: PatchParams {
                field_manager: Some(field_manager.into()),
                ..Default::default()
            },
        }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

fn decode(obj: DynamicObject) -> Result<PodSpecable, kube::Error> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(kube::Error::SerdeError)
}

#[async_trait]
impl Subjects for KubeSubjects {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodSpecable>, kube::Error> {
        self.api(resource, namespace)
            .get_opt(name)
            .await?
            .map(decode)
            .transpose()
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PodSpecable>, kube::Error> {
        let params = ListParams::default().labels(&selector.to_query());
        self.api(resource, namespace)
            .list(&params)
            .await?
            .items
            .into_iter()
            .map(decode)
            .collect()
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<(), kube::Error> {
        self.api(resource, namespace)
            .patch(name, &self.params, &Patch::Json::<()>(patch))
            .await?;
        Ok(())
    }
}
