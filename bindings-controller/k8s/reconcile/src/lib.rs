//! Bindings Controller reconciler
//!
//! Keeps each binding's subjects, status and finalizer consistent with the
//! binding's spec. A pass over one binding proceeds as follows:
//!
//! 1. If the binding is being deleted, undo its mutation on every subject
//!    that still exists, then remove its finalizer.
//! 2. Otherwise ensure the finalizer is present and the `Ready` condition is
//!    initialized.
//! 3. Resolve the subject: an exact name must exist; a selector may match
//!    nothing.
//! 4. Concurrently apply the mutation to a copy of each subject and patch the
//!    difference. A failure on one subject does not stop or roll back the
//!    others; the pass fails with the first error.
//! 5. Write the status, only if it changed.
//!
//! Failed passes are retried by the controller with per-binding backoff.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bindings;
mod error;
pub mod events;
mod metrics;
mod reconciler;
pub mod subjects;

#[cfg(test)]
mod tests;

pub use self::{
    bindings::{BindingWriter, KubeBindings},
    error::Error,
    events::{EventPublisher, KubeEventPublisher},
    metrics::ReconcileMetrics,
    reconciler::{error_policy, reconcile, Context, Leadership, Params},
    subjects::{KubeSubjects, Subjects},
};
