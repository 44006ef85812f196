#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod binding;
pub mod labels;
pub mod podspecable;
pub mod status;
pub mod subject;

pub use self::{
    binding::{EnvBinding, SecretBinding},
    labels::{Labels, Selector},
    podspecable::PodSpecable,
    status::{BindingStatus, Condition, ConditionStatus},
    subject::SubjectRef,
};
pub use k8s_openapi::{
    api::{
        self,
        admissionregistration::v1::{
            MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations,
        },
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        batch::v1::Job,
        core::v1::{
            Container, EnvVar, ObjectReference, PodSpec, PodTemplateSpec, Secret,
            SecretVolumeSource, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
    ByteString,
};
pub use kube::{
    api::{Api, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    core::{ApiResource, GroupVersion, GroupVersionKind},
    runtime::{reflector::ObjectRef, watcher},
    Client, Error, Resource, ResourceExt,
};
