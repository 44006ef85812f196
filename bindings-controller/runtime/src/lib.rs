#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use bindings_controller_core as core;
pub use bindings_controller_k8s_api as k8s;
pub use bindings_controller_k8s_index as index;
pub use bindings_controller_k8s_reconcile as reconcile;

mod admission;
mod args;
mod controller;
mod lease;
mod validation;
pub mod webhook;

pub use self::{
    admission::{Admission, AdmissionMetrics, Paths},
    args::Args,
};
