use crate::{
    bindings::BindingWriter,
    error::{self, Error},
    events::{reasons, EventPublisher},
    metrics::ReconcileMetrics,
    subjects::Subjects,
};
use bindings_controller_core::{
    conditions::reasons as status_reasons, Bindable, BindingId, Mutation, Selection, Subject,
};
use bindings_controller_k8s_api::{
    ApiResource, BindingStatus, PodSpecable, Resource, ResourceExt,
};
use bindings_controller_k8s_index::SharedTracker;
use chrono::{DateTime, Utc};
use kube::runtime::{controller::Action, events::EventType};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::watch, time::Duration};

/// Shared state for the binding controllers.
pub struct Context {
    subjects: Arc<dyn Subjects>,
    bindings: Arc<dyn BindingWriter>,
    events: Arc<dyn EventPublisher>,
    tracker: SharedTracker,
    leadership: Leadership,
    params: Params,
    failures: Mutex<HashMap<BindingId, u32>>,
    metrics: ReconcileMetrics,
}

#[derive(Copy, Clone, Debug)]
pub struct Params {
    /// How often a successfully reconciled binding is revisited.
    pub resync: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

/// Tracks whether this replica holds the write lease.
#[derive(Clone, Debug)]
pub struct Leadership {
    claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: String,
}

#[derive(Copy, Clone, Debug)]
enum Op {
    Do,
    Undo,
}

// === impl Leadership ===

impl Leadership {
    pub fn new(claims: watch::Receiver<Arc<kubert::lease::Claim>>, hostname: String) -> Self {
        Self { claims, hostname }
    }

    pub fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.hostname)
    }
}

// === impl Context ===

impl Context {
    pub fn new(
        subjects: Arc<dyn Subjects>,
        bindings: Arc<dyn BindingWriter>,
        events: Arc<dyn EventPublisher>,
        tracker: SharedTracker,
        leadership: Leadership,
        params: Params,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            subjects,
            bindings,
            events,
            tracker,
            leadership,
            params,
            failures: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    fn backoff(&self, id: &BindingId) -> Duration {
        let mut failures = self.failures.lock();
        let n = failures.entry(id.clone()).or_default();
        let delay = self
            .params
            .backoff_min
            .saturating_mul(2u32.saturating_pow(*n));
        *n = n.saturating_add(1);
        delay.min(self.params.backoff_max)
    }

    fn reset_backoff(&self, id: &BindingId) {
        self.failures.lock().remove(id);
    }
}

// === impl Op ===

impl Op {
    fn mutate(self, mutation: &Mutation, workload: &mut PodSpecable) {
        match self {
            Self::Do => mutation.apply(workload),
            Self::Undo => mutation.undo(workload),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Do => "do",
            Self::Undo => "undo",
        }
    }
}

/// Reconciles a single binding.
///
/// While the binding is live, its finalizer is ensured and its mutation is
/// applied to every subject. Once it is being deleted, the mutation is
/// undone on every subject that still exists and the finalizer is removed.
/// Only the lease holder acts; other replicas requeue.
#[tracing::instrument(skip_all, fields(binding = %binding.id()))]
pub async fn reconcile<B: Bindable + 'static>(
    binding: Arc<B>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    if !ctx.leadership.is_leader() {
        tracing::trace!("Not the leader; skipping");
        return Ok(Action::requeue(ctx.params.resync));
    }

    let id = binding.id();
    let result = if binding.is_deleting() {
        finalize(&*binding, &id, &ctx).await
    } else {
        bind(&*binding, &id, &ctx).await
    };

    match result {
        Ok(action) => {
            ctx.reset_backoff(&id);
            ctx.metrics.reconciled(B::KIND, "ok");
            Ok(action)
        }
        Err(error) => {
            ctx.metrics.reconciled(B::KIND, "error");
            ctx.events
                .publish(
                    &binding.object_ref(&()),
                    EventType::Warning,
                    reasons::INTERNAL_ERROR,
                    Some(error.to_string()),
                )
                .await;
            Err(error)
        }
    }
}

/// Requeues a failed binding with per-binding exponential backoff.
pub fn error_policy<B: Bindable>(binding: Arc<B>, error: &Error, ctx: Arc<Context>) -> Action {
    let id = binding.id();
    let delay = ctx.backoff(&id);
    tracing::info!(binding = %id, %error, ?delay, "Reconcile failed");
    Action::requeue(delay)
}

async fn bind<B: Bindable>(binding: &B, id: &BindingId, ctx: &Context) -> Result<Action, Error> {
    let finalizer = id.kind.finalizer();
    if !binding.finalizers().iter().any(|f| *f == finalizer) {
        let mut finalizers = binding.finalizers().to_vec();
        finalizers.push(finalizer);
        ctx.bindings
            .patch_finalizers(id, binding.meta().resource_version.as_deref(), finalizers)
            .await?;
        tracing::debug!("Added finalizer");
    }

    let now = Utc::now();
    let prior = binding.status().cloned().unwrap_or_default();
    let mut status = prior.clone();
    B::CONDITIONS.initialize(&mut status, now);

    let bound = bind_subjects::<B>(binding, id, ctx, &mut status, now).await;
    // A generation is observed only once every subject reflects it.
    if bound.is_ok() {
        status.observed_generation = binding.meta().generation;
    }
    let updated = update_status(binding, id, ctx, &prior, &status).await;
    bound?;
    updated?;
    Ok(Action::requeue(ctx.params.resync))
}

async fn bind_subjects<B: Bindable>(
    binding: &B,
    id: &BindingId,
    ctx: &Context,
    status: &mut BindingStatus,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let subject = match binding.subject() {
        Ok(subject) => subject,
        Err(error) => {
            B::CONDITIONS.mark_false(
                status,
                status_reasons::MALFORMED_SUBJECT,
                error.to_string(),
                now,
            );
            return Err(error.into());
        }
    };
    ctx.tracker.track(id.clone(), subject.clone());

    let resource = subject.api_resource();
    let workloads = match locate(&*ctx.subjects, &subject, &resource).await {
        Ok(workloads) => workloads,
        Err(error) => {
            if let Error::SubjectMissing { .. } = error {
                B::CONDITIONS.mark_false(
                    status,
                    status_reasons::SUBJECT_MISSING,
                    error.to_string(),
                    now,
                );
            }
            return Err(error);
        }
    };
    if workloads.is_empty() {
        tracing::info!(%subject, "Selector matches no subjects");
    }

    let mutation = binding.mutation();
    let results = futures::future::join_all(
        workloads
            .iter()
            .map(|w| patch_subject(ctx, id, &resource, &mutation, Op::Do, w)),
    )
    .await;
    if let Some(error) = results.into_iter().find_map(Result::err) {
        B::CONDITIONS.mark_false(
            status,
            status_reasons::BINDING_FAILED,
            error.to_string(),
            now,
        );
        return Err(error);
    }

    B::CONDITIONS.mark_true(status, now);
    Ok(())
}

async fn finalize<B: Bindable>(
    binding: &B,
    id: &BindingId,
    ctx: &Context,
) -> Result<Action, Error> {
    let finalizer = id.kind.finalizer();
    if !binding.finalizers().iter().any(|f| *f == finalizer) {
        ctx.tracker.untrack(id);
        return Ok(Action::await_change());
    }

    let prior = binding.status().cloned().unwrap_or_default();
    let mut status = prior.clone();
    B::CONDITIONS.mark_unknown(
        &mut status,
        status_reasons::FINALIZING,
        "Undoing the binding on its subjects",
        Utc::now(),
    );
    update_status(binding, id, ctx, &prior, &status).await?;

    match binding.subject() {
        Ok(subject) => unbind_subjects(binding, id, ctx, &subject).await?,
        Err(error) => tracing::info!(%error, "No subjects to undo"),
    }

    let finalizers = binding
        .finalizers()
        .iter()
        .filter(|f| **f != finalizer)
        .cloned()
        .collect();
    ctx.bindings.patch_finalizers(id, None, finalizers).await?;
    ctx.tracker.untrack(id);
    ctx.events
        .publish(
            &binding.object_ref(&()),
            EventType::Normal,
            reasons::FINALIZER_REMOVED,
            Some(format!("Removed finalizer {finalizer}")),
        )
        .await;
    tracing::debug!("Removed finalizer");
    Ok(Action::await_change())
}

/// Undoes the binding's mutation on its subjects. Subjects that no longer
/// exist have nothing to undo.
async fn unbind_subjects<B: Bindable>(
    binding: &B,
    id: &BindingId,
    ctx: &Context,
    subject: &Subject,
) -> Result<(), Error> {
    let resource = subject.api_resource();
    let workloads = match locate(&*ctx.subjects, subject, &resource).await {
        Ok(workloads) => workloads,
        Err(error) if error.is_not_found() => return Ok(()),
        Err(error) => return Err(error),
    };

    let mutation = binding.mutation();
    let results = futures::future::join_all(
        workloads
            .iter()
            .map(|w| patch_subject(ctx, id, &resource, &mutation, Op::Undo, w)),
    )
    .await;
    results
        .into_iter()
        .filter(|r| !matches!(r, Err(e) if e.is_not_found()))
        .find_map(Result::err)
        .map_or(Ok(()), Err)
}

/// Resolves a subject to its live resources.
async fn locate(
    subjects: &dyn Subjects,
    subject: &Subject,
    resource: &ApiResource,
) -> Result<Vec<PodSpecable>, Error> {
    match &subject.selection {
        Selection::Name(name) => match subjects.get(resource, &subject.namespace, name).await? {
            Some(workload) => Ok(vec![workload]),
            None => Err(Error::SubjectMissing {
                subject: subject.to_string(),
            }),
        },
        Selection::Selector(selector) => {
            let workloads = subjects
                .list(resource, &subject.namespace, selector)
                .await?;
            Ok(workloads)
        }
    }
}

/// Mutates a copy of the workload and patches the difference, if any.
async fn patch_subject(
    ctx: &Context,
    id: &BindingId,
    resource: &ApiResource,
    mutation: &Mutation,
    op: Op,
    workload: &PodSpecable,
) -> Result<(), Error> {
    let mut desired = workload.clone();
    op.mutate(mutation, &mut desired);

    let patch = json_patch::diff(
        &serde_json::to_value(workload)?,
        &serde_json::to_value(&desired)?,
    );
    if patch.0.is_empty() {
        return Ok(());
    }

    let namespace = workload.metadata.namespace.clone().unwrap_or_default();
    let name = workload.metadata.name.clone().unwrap_or_default();
    tracing::debug!(%namespace, %name, op = op.as_str(), "Patching subject");
    ctx.subjects
        .patch(resource, &namespace, &name, patch)
        .await
        .map_err(|source| Error::Patch {
            resource: resource.plural.clone(),
            namespace,
            name,
            source,
        })?;
    ctx.metrics.patched(id.kind, op.as_str());
    Ok(())
}

/// Writes the status if it differs from what was last observed.
async fn update_status<B: Bindable>(
    binding: &B,
    id: &BindingId,
    ctx: &Context,
    prior: &BindingStatus,
    status: &BindingStatus,
) -> Result<(), Error> {
    if prior == status {
        return Ok(());
    }
    if let Err(error) = ctx.bindings.patch_status(id, status).await {
        if error::is_not_found(&error) {
            return Ok(());
        }
        ctx.events
            .publish(
                &binding.object_ref(&()),
                EventType::Warning,
                reasons::UPDATE_FAILED,
                Some(format!("Failed to update status: {error}")),
            )
            .await;
        return Err(error.into());
    }
    tracing::debug!("Updated status");
    Ok(())
}
