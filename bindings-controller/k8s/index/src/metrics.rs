use bindings_controller_core::BindingKind;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    bindings: Family<KindLabels, Gauge>,
    dispatch_entries: Family<DispatchLabels, Gauge>,
    malformed: Family<KindLabels, Counter>,
    rebuilds: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DispatchLabels {
    selection: String,
}

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let bindings = Family::default();
        prom.register(
            "bindings",
            "Gauge of the number of bindings in the index",
            bindings.clone(),
        );

        let dispatch_entries = Family::default();
        prom.register(
            "dispatch_entries",
            "Gauge of the number of admission dispatch entries by subject selection",
            dispatch_entries.clone(),
        );

        let malformed = Family::default();
        prom.register(
            "malformed",
            "Count of bindings ignored because their subject could not be resolved",
            malformed.clone(),
        );

        let rebuilds = Counter::default();
        prom.register(
            "rebuilds",
            "Count of dispatch snapshot rebuilds",
            rebuilds.clone(),
        );

        Self {
            bindings,
            dispatch_entries,
            malformed,
            rebuilds,
        }
    }

    pub(crate) fn malformed(&self, kind: BindingKind) {
        self.malformed
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub(crate) fn rebuilt(&self, counts: &[(BindingKind, usize)], exact: usize, selector: usize) {
        self.rebuilds.inc();
        for (kind, n) in counts {
            self.bindings
                .get_or_create(&KindLabels {
                    kind: kind.to_string(),
                })
                .set(*n as i64);
        }
        for (selection, n) in [("name", exact), ("selector", selector)] {
            self.dispatch_entries
                .get_or_create(&DispatchLabels {
                    selection: selection.to_string(),
                })
                .set(n as i64);
        }
    }
}
