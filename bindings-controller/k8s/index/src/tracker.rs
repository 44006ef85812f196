use bindings_controller_core::{BindingId, GroupKind, Subject};
use bindings_controller_k8s_api::Labels;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// Records the subject each binding resolved on its last reconcile so that
/// changes to a workload can be mapped back to the bindings that target it.
#[derive(Debug, Default)]
pub struct SubjectTracker(RwLock<HashMap<BindingId, Subject>>);

pub type SharedTracker = Arc<SubjectTracker>;

impl SubjectTracker {
    pub fn shared() -> SharedTracker {
        Arc::new(Self::default())
    }

    pub fn track(&self, binding: BindingId, subject: Subject) {
        self.0.write().insert(binding, subject);
    }

    pub fn untrack(&self, binding: &BindingId) {
        self.0.write().remove(binding);
    }

    pub fn is_tracked(&self, binding: &BindingId) -> bool {
        self.0.read().contains_key(binding)
    }

    /// Lists the bindings whose subject selects the given resource.
    pub fn bindings_for(
        &self,
        group_kind: &GroupKind,
        namespace: &str,
        name: &str,
        labels: &Labels,
    ) -> Vec<BindingId> {
        let mut ids = self
            .0
            .read()
            .iter()
            .filter(|(_, subject)| subject.selects(group_kind, namespace, name, labels))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }
}
