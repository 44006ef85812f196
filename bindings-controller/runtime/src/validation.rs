use crate::{
    core::Subject,
    k8s::{
        binding::{EnvBindingSpec, SecretBindingSpec},
        SubjectRef,
    },
};
use anyhow::{bail, Result};
use std::collections::HashSet;

/// Resolves the subject reference exactly as the controller will.
pub(crate) fn validate_subject(subject: &SubjectRef, binding_ns: &str) -> Result<Subject> {
    Ok(Subject::from_ref(subject, binding_ns)?)
}

pub(crate) fn validate_secret(spec: &SecretBindingSpec) -> Result<()> {
    if spec.secret.name.is_empty() {
        bail!("secret name must not be empty");
    }
    if let Some(path) = spec.mount_path.as_deref() {
        if !path.starts_with('/') {
            bail!("mountPath must be absolute: {path}");
        }
        if path.split('/').any(|seg| seg == "..") {
            bail!("mountPath must not contain '..': {path}");
        }
    }
    Ok(())
}

pub(crate) fn validate_env(spec: &EnvBindingSpec) -> Result<()> {
    if spec.env.is_empty() {
        bail!("env must not be empty");
    }
    let mut names = HashSet::with_capacity(spec.env.len());
    for var in &spec.env {
        if var.name.is_empty() {
            bail!("env var name must not be empty");
        }
        if !names.insert(var.name.as_str()) {
            bail!("duplicate env var: {}", var.name);
        }
    }
    Ok(())
}
