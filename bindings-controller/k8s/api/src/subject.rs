use crate::labels::Selector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// References the workload(s) a binding mutates.
///
/// Exactly one of `name` or `selector` is expected to be set. When
/// `namespace` is omitted, the binding's own namespace is used.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
}
