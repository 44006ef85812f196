use crate::{
    conditions::ConditionSet,
    mutation::Mutation,
    subject::{InvalidSubject, Subject},
};
use bindings_controller_k8s_api::{
    binding, BindingStatus, EnvBinding, ObjectRef, Resource, ResourceExt, SecretBinding,
    SubjectRef,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, hash::Hash};

/// The binding kinds served by the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BindingKind {
    Secret,
    Env,
}

/// Identifies a binding resource.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingId {
    pub kind: BindingKind,
    pub namespace: String,
    pub name: String,
}

/// A binding resolved into the parts the controller acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub id: BindingId,
    pub subject: Subject,
    pub mutation: Mutation,
}

/// Implemented by each binding resource type.
pub trait Bindable:
    Resource<DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync
{
    const KIND: BindingKind;

    /// The conditions this kind reports in its status.
    const CONDITIONS: ConditionSet = ConditionSet::READY;

    fn subject_ref(&self) -> &SubjectRef;

    fn mutation(&self) -> Mutation;

    fn status(&self) -> Option<&BindingStatus>;

    fn id(&self) -> BindingId {
        BindingId {
            kind: Self::KIND,
            namespace: self.namespace().unwrap_or_default(),
            name: self.name_unchecked(),
        }
    }

    /// Resolves the binding's subject, defaulting its namespace to the
    /// binding's own.
    fn subject(&self) -> Result<Subject, InvalidSubject> {
        Subject::from_ref(self.subject_ref(), &self.namespace().unwrap_or_default())
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

// === impl BindingKind ===

impl BindingKind {
    pub const ALL: [Self; 2] = [Self::Secret, Self::Env];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Secret => "SecretBinding",
            Self::Env => "EnvBinding",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            Self::Secret => "secretbindings",
            Self::Env => "envbindings",
        }
    }

    /// The finalizer this kind places on its resources, so that two kinds
    /// bound to the same workload never remove one another's finalizer.
    pub fn finalizer(&self) -> String {
        format!("{}.{}", self.plural(), binding::GROUP)
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

// === impl BindingId ===

impl BindingId {
    pub fn object_ref<B: Bindable>(&self) -> ObjectRef<B> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.kind, self.namespace, self.name)
    }
}

// === impl Binding ===

impl Binding {
    pub fn from_resource<B: Bindable>(resource: &B) -> Result<Self, InvalidSubject> {
        Ok(Self {
            id: resource.id(),
            subject: resource.subject()?,
            mutation: resource.mutation(),
        })
    }
}

// === impl SecretBinding ===

impl Bindable for SecretBinding {
    const KIND: BindingKind = BindingKind::Secret;

    fn subject_ref(&self) -> &SubjectRef {
        &self.spec.subject
    }

    fn mutation(&self) -> Mutation {
        Mutation::secret(
            &self.name_unchecked(),
            self.spec.secret.name.clone(),
            self.spec.mount_path.as_deref(),
        )
    }

    fn status(&self) -> Option<&BindingStatus> {
        self.status.as_ref()
    }
}

// === impl EnvBinding ===

impl Bindable for EnvBinding {
    const KIND: BindingKind = BindingKind::Env;

    fn subject_ref(&self) -> &SubjectRef {
        &self.spec.subject
    }

    fn mutation(&self) -> Mutation {
        Mutation::env(
            self.spec
                .env
                .iter()
                .map(|v| (v.name.clone(), v.value.clone())),
        )
    }

    fn status(&self) -> Option<&BindingStatus> {
        self.status.as_ref()
    }
}
