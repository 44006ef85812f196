//! The per-kind pod template mutations.
//!
//! Every binding kind provides a pair of operations over a workload's pod
//! template. `apply` first reverses any previous application and then
//! re-applies, so applying twice yields the same template as applying once,
//! and `undo` after `apply` restores the template to its original shape.

use bindings_controller_k8s_api::{
    Container, EnvVar, PodSpec, PodSpecable, SecretVolumeSource, Volume, VolumeMount,
};
use sha2::{Digest, Sha256};

/// Kubernetes limits volume names to DNS labels.
const MAX_VOLUME_NAME_LEN: usize = 63;

/// Hex digits of the binding name's digest kept in a shortened volume name.
const VOLUME_HASH_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Mounts a secret read-only into every container.
    Secret(SecretMount),

    /// Sets environment variables, in order, on every container.
    Env(Vec<(String, String)>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretMount {
    pub volume: String,
    pub secret: String,
    pub mount_path: String,
}

// === impl Mutation ===

impl Mutation {
    pub fn secret(binding: &str, secret: impl Into<String>, mount_path: Option<&str>) -> Self {
        let volume = volume_name(binding);
        let mount_path = match mount_path {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => format!("/var/bindings/{binding}"),
        };
        Self::Secret(SecretMount {
            volume,
            secret: secret.into(),
            mount_path,
        })
    }

    pub fn env(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self::Env(vars.into_iter().collect())
    }

    /// Applies the mutation to the workload's pod template.
    ///
    /// Workloads without a pod spec are left untouched.
    pub fn apply(&self, workload: &mut PodSpecable) {
        self.undo(workload);

        let Some(spec) = workload.spec.template.spec.as_mut() else {
            return;
        };
        match self {
            Self::Secret(mount) => {
                spec.volumes.get_or_insert_with(Vec::new).push(Volume {
                    name: mount.volume.clone(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(mount.secret.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                for c in containers_mut(spec) {
                    c.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
                        name: mount.volume.clone(),
                        mount_path: mount.mount_path.clone(),
                        read_only: Some(true),
                        ..Default::default()
                    });
                }
            }

            Self::Env(vars) => {
                for c in containers_mut(spec) {
                    c.env
                        .get_or_insert_with(Vec::new)
                        .extend(vars.iter().map(|(name, value)| EnvVar {
                            name: name.clone(),
                            value: Some(value.clone()),
                            value_from: None,
                        }));
                }
            }
        }
    }

    /// Removes everything `apply` would have added to the workload's pod
    /// template. Removing something that is absent is not an error.
    pub fn undo(&self, workload: &mut PodSpecable) {
        let Some(spec) = workload.spec.template.spec.as_mut() else {
            return;
        };
        match self {
            Self::Secret(mount) => {
                retain(&mut spec.volumes, |v| v.name != mount.volume);
                for c in containers_mut(spec) {
                    retain(&mut c.volume_mounts, |m| m.name != mount.volume);
                }
            }

            Self::Env(vars) => {
                for c in containers_mut(spec) {
                    retain(&mut c.env, |e| !vars.iter().any(|(name, _)| *name == e.name));
                }
            }
        }
    }
}

fn containers_mut(spec: &mut PodSpec) -> impl Iterator<Item = &mut Container> {
    spec.init_containers
        .iter_mut()
        .flatten()
        .chain(spec.containers.iter_mut())
}

/// Names the volume for a secret binding. Names too long for a volume keep
/// a prefix and end in a digest of the full binding name, so distinct
/// bindings never share a volume.
fn volume_name(binding: &str) -> String {
    let volume = format!("secretbinding-{binding}");
    if volume.len() <= MAX_VOLUME_NAME_LEN {
        return volume;
    }

    let mut hasher = Sha256::new();
    hasher.update(binding.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let prefix = &volume[..MAX_VOLUME_NAME_LEN - VOLUME_HASH_LEN - 1];
    format!(
        "{}-{}",
        prefix.trim_end_matches(['-', '.']),
        &digest[..VOLUME_HASH_LEN]
    )
}

/// Filters an optional list, dropping it entirely once it is empty so that
/// removal leaves no `[]` behind in the serialized template.
fn retain<T>(list: &mut Option<Vec<T>>, f: impl FnMut(&T) -> bool) {
    if let Some(items) = list.as_mut() {
        items.retain(f);
        if items.is_empty() {
            *list = None;
        }
    }
}
