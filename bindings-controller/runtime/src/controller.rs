use crate::{
    core::{Bindable, GroupKind},
    index::SharedTracker,
    k8s::{Api, ApiResource, Client, DynamicObject, GroupVersionKind, Labels, ObjectRef, ResourceExt},
    reconcile::{self, Context},
};
use futures::prelude::*;
use kube::runtime::{watcher, Controller};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Workload kinds whose changes requeue the bindings that target them.
const WATCHED_SUBJECTS: [(&str, &str, &str); 5] = [
    ("apps", "v1", "Deployment"),
    ("apps", "v1", "StatefulSet"),
    ("apps", "v1", "DaemonSet"),
    ("apps", "v1", "ReplicaSet"),
    ("batch", "v1", "Job"),
];

/// Runs the controller for one binding kind until shutdown.
///
/// Bindings are reconciled on every change to the binding itself and to
/// any watched workload that its subject selects.
pub async fn run<B>(client: Client, tracker: SharedTracker, ctx: Arc<Context>, drain: drain::Watch)
where
    B: Bindable + 'static,
{
    let mut controller = Controller::new(Api::<B>::all(client.clone()), watcher::Config::default());
    for (group, version, kind) in WATCHED_SUBJECTS {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
        let api = Api::<DynamicObject>::all_with(client.clone(), &resource);
        let group_kind = GroupKind::new(group, kind);
        let tracker = tracker.clone();
        controller = controller.watches_with(
            api,
            resource,
            watcher::Config::default(),
            move |obj: DynamicObject| {
                let namespace = obj.namespace().unwrap_or_default();
                let labels = Labels::from(obj.metadata.labels.clone());
                tracker
                    .bindings_for(&group_kind, &namespace, &obj.name_any(), &labels)
                    .into_iter()
                    .filter(|id| id.kind == B::KIND)
                    .map(|id| id.object_ref::<B>())
                    .collect::<Vec<ObjectRef<B>>>()
            },
        );
    }

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::pin! {
        let reconciles = controller
            .graceful_shutdown_on(close_rx.map(|_| {}))
            .run(reconcile::reconcile::<B>, reconcile::error_policy::<B>, ctx)
            .for_each(|res| {
                match res {
                    Ok((obj, action)) => debug!(binding = %obj, ?action, "Reconciled"),
                    Err(error) => warn!(%error, "Reconcile failed"),
                }
                future::ready(())
            });
    }

    info!(kind = %B::KIND, "Controller started");
    tokio::select! {
        _ = (&mut reconciles) => {}
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(reconciles).await;
        }
    }
}
