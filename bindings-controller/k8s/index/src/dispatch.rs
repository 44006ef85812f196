//! Maps an admitted workload to the bindings that apply to it.

use bindings_controller_core::{Binding, BindingId, BindingKind, GroupKind, Selection};
use bindings_controller_k8s_api::{Labels, Selector};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ExactKey {
    group_kind: GroupKind,
    namespace: String,
    name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct InexactKey {
    group_kind: GroupKind,
    namespace: String,
}

/// An immutable view of all bindings, keyed for admission lookups.
///
/// Each binding kind is indexed on its own, so a workload may be matched by
/// at most one binding of every kind.
#[derive(Debug, Default)]
pub struct Snapshot {
    kinds: BTreeMap<BindingKind, KindIndex>,
}

#[derive(Debug, Default)]
struct KindIndex {
    exact: HashMap<ExactKey, Binding>,
    inexact: HashMap<InexactKey, Vec<(Selector, Binding)>>,
}

/// Holds the current [`Snapshot`].
///
/// Lookups clone the snapshot's `Arc` under a read lock and never observe a
/// partially built index; rebuilds construct a new snapshot without holding
/// the lock and only take the write side to swap it in.
#[derive(Clone, Debug, Default)]
pub struct Dispatch(Arc<RwLock<Arc<Snapshot>>>);

// === impl Snapshot ===

impl Snapshot {
    /// Builds a snapshot from the full set of bindings.
    ///
    /// When several bindings of a kind name the same exact subject, the last
    /// one in iteration order wins. Selector bindings are kept in iteration
    /// order and the first matching selector of each kind wins at lookup.
    pub fn rebuild(bindings: impl IntoIterator<Item = Binding>) -> Self {
        let mut kinds = BTreeMap::<_, KindIndex>::new();

        for binding in bindings {
            let index = kinds.entry(binding.id.kind).or_default();
            let group_kind = binding.subject.group_kind.clone();
            let namespace = binding.subject.namespace.clone();
            match binding.subject.selection.clone() {
                Selection::Name(name) => {
                    let key = ExactKey {
                        group_kind,
                        namespace,
                        name,
                    };
                    if let Some(prior) = index.exact.insert(key, binding) {
                        tracing::warn!(
                            binding = %prior.id,
                            subject = %prior.subject,
                            "Subject is claimed by more than one binding",
                        );
                    }
                }
                Selection::Selector(selector) => {
                    index
                        .inexact
                        .entry(InexactKey {
                            group_kind,
                            namespace,
                        })
                        .or_default()
                        .push((selector, binding));
                }
            }
        }

        Self { kinds }
    }

    /// Finds the bindings that apply to the given resource, at most one per
    /// kind, ordered by kind.
    pub fn lookup(
        &self,
        group_kind: &GroupKind,
        namespace: &str,
        name: &str,
        labels: &Labels,
    ) -> Vec<&Binding> {
        self.kinds
            .values()
            .filter_map(|index| index.lookup(group_kind, namespace, name, labels))
            .collect()
    }

    /// Finds the binding of `kind` that applies to the given resource. An
    /// exact binding takes precedence over selector bindings.
    pub fn lookup_kind(
        &self,
        kind: BindingKind,
        group_kind: &GroupKind,
        namespace: &str,
        name: &str,
        labels: &Labels,
    ) -> Option<&Binding> {
        self.kinds
            .get(&kind)?
            .lookup(group_kind, namespace, name, labels)
    }

    /// Returns the binding of `kind` that holds the exact subject, if any.
    pub fn exact_claim(
        &self,
        kind: BindingKind,
        group_kind: &GroupKind,
        namespace: &str,
        name: &str,
    ) -> Option<&BindingId> {
        let key = ExactKey {
            group_kind: group_kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.kinds.get(&kind)?.exact.get(&key).map(|b| &b.id)
    }

    pub fn exact_len(&self) -> usize {
        self.kinds.values().map(|i| i.exact.len()).sum()
    }

    pub fn inexact_len(&self) -> usize {
        self.kinds
            .values()
            .flat_map(|i| i.inexact.values())
            .map(Vec::len)
            .sum()
    }
}

// === impl KindIndex ===

impl KindIndex {
    fn lookup(
        &self,
        group_kind: &GroupKind,
        namespace: &str,
        name: &str,
        labels: &Labels,
    ) -> Option<&Binding> {
        let exact = ExactKey {
            group_kind: group_kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        if let Some(binding) = self.exact.get(&exact) {
            return Some(binding);
        }

        let inexact = InexactKey {
            group_kind: exact.group_kind,
            namespace: exact.namespace,
        };
        self.inexact
            .get(&inexact)?
            .iter()
            .find(|(selector, _)| selector.matches(labels))
            .map(|(_, binding)| binding)
    }
}

// === impl Dispatch ===

impl Dispatch {
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.0.read().clone()
    }

    pub fn swap(&self, snapshot: Snapshot) {
        *self.0.write() = Arc::new(snapshot);
    }

    pub fn lookup(
        &self,
        group_kind: &GroupKind,
        namespace: &str,
        name: &str,
        labels: &Labels,
    ) -> Vec<Binding> {
        self.snapshot()
            .lookup(group_kind, namespace, name, labels)
            .into_iter()
            .cloned()
            .collect()
    }
}
