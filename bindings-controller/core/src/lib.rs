//! The binding model shared by the controller's index, reconciler and
//! admission webhook.
//!
//! A binding names a subject (one workload by name, or every workload in a
//! namespace matching a label selector) and a mutation that is applied to
//! the subject's pod template. This crate resolves binding resources into
//! that model and implements each kind's mutation.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod binding;
pub mod conditions;
pub mod mutation;
pub mod subject;

pub use self::{
    binding::{Bindable, Binding, BindingId, BindingKind},
    conditions::ConditionSet,
    mutation::Mutation,
    subject::{GroupKind, InvalidSubject, Selection, Subject},
};
