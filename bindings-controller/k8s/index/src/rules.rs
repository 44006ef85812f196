//! Derives the admission webhook's interception rules from the bindings.

use bindings_controller_core::{GroupKind, Subject};
use bindings_controller_k8s_api::{ApiResource, GroupVersionKind, RuleWithOperations};
use std::collections::{BTreeMap, BTreeSet};

/// Workload kinds that are always intercepted, even with no bindings.
pub const BASELINE: [(&str, &str, &str); 4] = [
    ("apps", "v1", "Deployment"),
    ("apps", "v1", "StatefulSet"),
    ("apps", "v1", "DaemonSet"),
    ("batch", "v1", "Job"),
];

const OPERATIONS: [&str; 2] = ["CREATE", "UPDATE"];

/// The scope the API server records for a rule that does not set one.
const ANY_SCOPE: &str = "*";

/// Intercepts every version of one resource type that some binding targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub group: String,
    /// Sorted.
    pub versions: Vec<String>,
    /// The lowercase plural resource name, e.g. `deployments`.
    pub resource: String,
}

/// Computes the rules for the given subjects: one per group/kind, sorted by
/// group, first version and resource so that the output does not depend on
/// the order of its input.
pub fn synthesize<'s>(subjects: impl IntoIterator<Item = &'s Subject>) -> Vec<Rule> {
    let mut kinds = BTreeMap::<GroupKind, BTreeSet<String>>::new();
    for (group, version, kind) in BASELINE {
        kinds
            .entry(GroupKind::new(group, kind))
            .or_default()
            .insert(version.to_string());
    }
    for subject in subjects {
        kinds
            .entry(subject.group_kind.clone())
            .or_default()
            .insert(subject.version.clone());
    }

    let mut rules = kinds
        .into_iter()
        .map(|(gk, versions)| {
            let versions = versions.into_iter().collect::<Vec<_>>();
            let version = versions.first().map(String::as_str).unwrap_or_default();
            let gvk = GroupVersionKind::gvk(&gk.group, version, &gk.kind);
            let resource = ApiResource::from_gvk(&gvk).plural;
            Rule {
                group: gk.group,
                versions,
                resource,
            }
        })
        .collect::<Vec<_>>();
    rules.sort_by(|a, b| {
        a.group
            .cmp(&b.group)
            .then_with(|| a.versions.first().cmp(&b.versions.first()))
            .then_with(|| a.resource.cmp(&b.resource))
    });
    rules
}

// === impl Rule ===

impl Rule {
    /// Matches the resource itself and all of its subresources on create and
    /// update. The scope is spelled out as the API server's default so that a
    /// stored configuration compares equal to a freshly rendered one.
    pub fn to_webhook_rule(&self) -> RuleWithOperations {
        RuleWithOperations {
            api_groups: Some(vec![self.group.clone()]),
            api_versions: Some(self.versions.clone()),
            operations: Some(OPERATIONS.iter().map(|op| op.to_string()).collect()),
            resources: Some(vec![self.resource.clone(), format!("{}/*", self.resource)]),
            scope: Some(ANY_SCOPE.to_string()),
        }
    }
}
