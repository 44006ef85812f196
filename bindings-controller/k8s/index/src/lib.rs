//! Bindings Controller index
//!
//! All replicas watch the binding resources and keep them in a
//! [`BindingStore`]. Every change to the binding set rebuilds two derived
//! views:
//!
//! - the dispatch [`Snapshot`], which the admission webhook consults to find
//!   the bindings that apply to an incoming workload, at most one per binding
//!   kind. Within a kind, exact subjects are keyed by group, kind, namespace
//!   and name; selector subjects are keyed by group, kind and namespace and
//!   hold an ordered list of selectors.
//! - the interception [`Rule`]s that the webhook configuration must carry so
//!   that the API server routes every bound workload kind to the webhook.
//!
//! The [`SubjectTracker`] is maintained by the reconciler and maps workload
//! changes back to the bindings that target them.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dispatch;
pub mod metrics;
pub mod rules;
mod store;
pub mod tracker;


pub use self::{
    dispatch::{Dispatch, Snapshot},
    metrics::IndexMetrics,
    rules::Rule,
    store::{BindingStore, SharedStore},
    tracker::{SharedTracker, SubjectTracker},
};
