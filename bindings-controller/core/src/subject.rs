use bindings_controller_k8s_api::{
    labels::InvalidSelector, ApiResource, GroupVersion, GroupVersionKind, Labels, Selector,
    SubjectRef,
};
use std::fmt;
use thiserror::Error;

/// A resource type, independent of its version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

/// A resolved reference to the workload(s) a binding targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub group_kind: GroupKind,
    pub version: String,
    pub namespace: String,
    pub selection: Selection,
}

/// How a subject picks its workloads: a single resource by name or all
/// resources matching a label selector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Name(String),
    Selector(Selector),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidSubject {
    #[error("invalid apiVersion: {0:?}")]
    ApiVersion(String),

    #[error("subject kind must be set")]
    MissingKind,

    #[error("subject namespace must be set")]
    MissingNamespace,

    #[error("subject must set exactly one of 'name' or 'selector'")]
    Selection,

    #[error(transparent)]
    Selector(#[from] InvalidSelector),
}

// === impl GroupKind ===

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            return f.write_str(&self.kind);
        }
        write!(f, "{}.{}", self.kind, self.group)
    }
}

// === impl Subject ===

impl Subject {
    /// Resolves a subject reference declared by a binding in `binding_ns`.
    pub fn from_ref(subject: &SubjectRef, binding_ns: &str) -> Result<Self, InvalidSubject> {
        let GroupVersion { group, version } = parse_api_version(&subject.api_version)?;
        if subject.kind.is_empty() {
            return Err(InvalidSubject::MissingKind);
        }

        let namespace = match subject.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ if !binding_ns.is_empty() => binding_ns.to_string(),
            _ => return Err(InvalidSubject::MissingNamespace),
        };

        let selection = match (subject.name.as_deref(), subject.selector.as_ref()) {
            (Some(name), None) if !name.is_empty() => Selection::Name(name.to_string()),
            (None, Some(selector)) => {
                selector.validate()?;
                Selection::Selector(selector.clone())
            }
            _ => return Err(InvalidSubject::Selection),
        };

        Ok(Self {
            group_kind: GroupKind::new(group, subject.kind.clone()),
            version,
            namespace,
            selection,
        })
    }

    /// Describes the subject's resource type for the dynamic API, including
    /// its (lowercase, pluralized) resource name.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            &self.group_kind.group,
            &self.version,
            &self.group_kind.kind,
        ))
    }

    pub fn name(&self) -> Option<&str> {
        match &self.selection {
            Selection::Name(name) => Some(name),
            Selection::Selector(_) => None,
        }
    }

    /// Indicates whether a resource of the given type and identity is
    /// selected by this subject.
    pub fn selects(&self, gk: &GroupKind, namespace: &str, name: &str, labels: &Labels) -> bool {
        if self.group_kind != *gk || self.namespace != namespace {
            return false;
        }
        match &self.selection {
            Selection::Name(n) => n == name,
            Selection::Selector(selector) => selector.matches(labels),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selection {
            Selection::Name(name) => write!(f, "{}/{}.{}", self.group_kind, self.namespace, name),
            Selection::Selector(sel) => {
                write!(f, "{}/{}[{}]", self.group_kind, self.namespace, sel)
            }
        }
    }
}

/// Splits an `apiVersion` (`group/version` or, for the core group, just
/// `version`) into its parts.
pub fn parse_api_version(api_version: &str) -> Result<GroupVersion, InvalidSubject> {
    let invalid = || InvalidSubject::ApiVersion(api_version.to_string());
    let gv = api_version
        .parse::<GroupVersion>()
        .map_err(|_| invalid())?;
    if gv.version.is_empty() || gv.version.contains('/') {
        return Err(invalid());
    }
    Ok(gv)
}
