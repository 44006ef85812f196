use bindings_controller_core::BindingKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
    patches: Family<PatchLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    kind: String,
    result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PatchLabels {
    kind: String,
    operation: String,
}

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of binding reconciles by result",
            reconciles.clone(),
        );

        let patches = Family::default();
        prom.register(
            "subject_patches",
            "Count of patches sent to subjects",
            patches.clone(),
        );

        Self {
            reconciles,
            patches,
        }
    }

    pub(crate) fn reconciled(&self, kind: BindingKind, result: &'static str) {
        self.reconciles
            .get_or_create(&ReconcileLabels {
                kind: kind.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    pub(crate) fn patched(&self, kind: BindingKind, operation: &'static str) {
        self.patches
            .get_or_create(&PatchLabels {
                kind: kind.to_string(),
                operation: operation.to_string(),
            })
            .inc();
    }
}
