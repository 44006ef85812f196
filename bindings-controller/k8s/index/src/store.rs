use crate::{
    dispatch::{Dispatch, Snapshot},
    metrics::IndexMetrics,
    rules::{self, Rule},
};
use bindings_controller_core::{Bindable, Binding, BindingId, BindingKind};
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::sync::watch;

pub type SharedStore = Arc<RwLock<BindingStore>>;

/// Holds every live binding of every kind, fed by the binding watches.
///
/// Each change to the binding set rebuilds the dispatch snapshot and
/// notifies the webhook configuration reconciler. Bindings are kept ordered
/// by kind, namespace and name, which fixes the precedence between bindings
/// that claim the same exact subject.
///
/// The store is synced once the initial listing of every binding kind has
/// been indexed. Until then its rules reflect a partial binding set.
#[derive(Debug)]
pub struct BindingStore {
    bindings: BTreeMap<BindingId, Binding>,
    synced: BTreeSet<BindingKind>,
    dispatch: Dispatch,
    changes: watch::Sender<()>,
    metrics: IndexMetrics,
}

// === impl BindingStore ===

impl BindingStore {
    pub fn shared(dispatch: Dispatch, metrics: IndexMetrics) -> (SharedStore, watch::Receiver<()>) {
        let (changes, rx) = watch::channel(());
        let store = Self {
            bindings: BTreeMap::new(),
            synced: BTreeSet::new(),
            dispatch,
            changes,
            metrics,
        };
        (Arc::new(RwLock::new(store)), rx)
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn get(&self, id: &BindingId) -> Option<&Binding> {
        self.bindings.get(id)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// True once every binding kind has completed its initial listing.
    pub fn is_synced(&self) -> bool {
        BindingKind::ALL.iter().all(|k| self.synced.contains(k))
    }

    /// The interception rules for the current binding set.
    pub fn rules(&self) -> Vec<Rule> {
        rules::synthesize(self.bindings.values().map(|b| &b.subject))
    }

    /// Records a binding resource, returning true if the binding set changed.
    ///
    /// Bindings that are being deleted no longer apply to admitted
    /// workloads, and bindings whose subject cannot be resolved are dropped
    /// (their status reports the problem).
    fn insert<B: Bindable>(&mut self, resource: &B) -> bool {
        let id = resource.id();
        if resource.is_deleting() {
            return self.bindings.remove(&id).is_some();
        }

        match Binding::from_resource(resource) {
            Ok(binding) => {
                if self.bindings.get(&id) == Some(&binding) {
                    return false;
                }
                tracing::debug!(binding = %id, subject = %binding.subject, "Indexed");
                self.bindings.insert(id, binding);
                true
            }
            Err(error) => {
                tracing::warn!(binding = %id, %error, "Ignoring binding with a malformed subject");
                self.metrics.malformed(B::KIND);
                self.bindings.remove(&id).is_some()
            }
        }
    }

    fn remove(&mut self, kind: BindingKind, namespace: String, name: String) -> bool {
        let id = BindingId {
            kind,
            namespace,
            name,
        };
        self.bindings.remove(&id).is_some()
    }

    fn publish(&mut self) {
        let snapshot = Snapshot::rebuild(self.bindings.values().cloned());
        let counts = BindingKind::ALL.map(|kind| {
            let n = self.bindings.keys().filter(|id| id.kind == kind).count();
            (kind, n)
        });
        self.metrics
            .rebuilt(&counts, snapshot.exact_len(), snapshot.inexact_len());
        self.dispatch.swap(snapshot);
        self.changes.send_replace(());
    }
}

impl<B: Bindable> kubert::index::IndexNamespacedResource<B> for BindingStore {
    fn apply(&mut self, resource: B) {
        if self.insert(&resource) {
            self.publish();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.remove(B::KIND, namespace, name) {
            self.publish();
        }
    }

    fn reset(&mut self, resources: Vec<B>, removed: NamespacedRemoved) {
        // The first listing of a kind is published even when empty so that
        // watchers learn the store became synced.
        let mut changed = self.synced.insert(B::KIND);
        for resource in &resources {
            changed |= self.insert(resource);
        }
        for (namespace, names) in removed {
            for name in names {
                changed |= self.remove(B::KIND, namespace.clone(), name);
            }
        }
        if changed {
            self.publish();
        }
    }
}
