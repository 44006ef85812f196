pub mod env;
pub mod secret;

pub use self::{
    env::{EnvBinding, EnvBindingSpec, EnvVar},
    secret::{SecretBinding, SecretBindingSpec, SecretRef},
};

pub const GROUP: &str = "bindings.podspec.dev";

/// Workloads and namespaces carrying this label with the value `true` are
/// never sent to the binding webhook.
pub const EXCLUDE_LABEL: &str = "bindings.podspec.dev/exclude";
