use crate::{
    error_policy, reconcile, BindingWriter, Context, Error, EventPublisher, Leadership, Params,
    ReconcileMetrics, Subjects,
};
use async_trait::async_trait;
use bindings_controller_core::{conditions, Bindable, BindingId, BindingKind};
use bindings_controller_k8s_api::{
    binding::{EnvBindingSpec, EnvVar, SecretBindingSpec, SecretRef},
    ApiResource, BindingStatus, ConditionStatus, EnvBinding, Labels, ObjectReference,
    PodSpecable, SecretBinding, Selector, SubjectRef,
};
use bindings_controller_k8s_index::{SharedTracker, SubjectTracker};
use chrono::{DateTime, Utc};
use kube::{core::ErrorResponse, runtime::controller::Action, runtime::events::EventType};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};
use tokio::{sync::watch, time::Duration};

const HOSTNAME: &str = "test";
const FINALIZER: &str = "secretbindings.bindings.podspec.dev";

const PARAMS: Params = Params {
    resync: Duration::from_secs(300),
    backoff_min: Duration::from_secs(1),
    backoff_max: Duration::from_secs(8),
};

#[derive(Default)]
struct FakeSubjects {
    workloads: Mutex<BTreeMap<String, PodSpecable>>,
    failing: HashSet<String>,
    patches: Mutex<Vec<String>>,
}

#[derive(Default)]
struct FakeBindings {
    finalizers: Mutex<Vec<(Option<String>, Vec<String>)>>,
    statuses: Mutex<Vec<BindingStatus>>,
}

#[derive(Default)]
struct FakeEvents(Mutex<Vec<String>>);

struct Harness {
    subjects: Arc<FakeSubjects>,
    bindings: Arc<FakeBindings>,
    events: Arc<FakeEvents>,
    tracker: SharedTracker,
    _claims: watch::Sender<Arc<kubert::lease::Claim>>,
    ctx: Arc<Context>,
}

// === impl FakeSubjects ===

#[async_trait]
impl Subjects for FakeSubjects {
    async fn get(
        &self,
        _: &ApiResource,
        _: &str,
        name: &str,
    ) -> Result<Option<PodSpecable>, kube::Error> {
        Ok(self.workloads.lock().get(name).cloned())
    }

    async fn list(
        &self,
        _: &ApiResource,
        _: &str,
        selector: &Selector,
    ) -> Result<Vec<PodSpecable>, kube::Error> {
        Ok(self
            .workloads
            .lock()
            .values()
            .filter(|w| selector.matches(&Labels::from(w.metadata.labels.clone())))
            .cloned()
            .collect())
    }

    async fn patch(
        &self,
        _: &ApiResource,
        _: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<(), kube::Error> {
        if self.failing.contains(name) {
            return Err(api_error(403, "Forbidden"));
        }
        let mut workloads = self.workloads.lock();
        let Some(workload) = workloads.get_mut(name) else {
            return Err(api_error(404, "NotFound"));
        };
        let mut value = serde_json::to_value(&*workload).expect("workload must encode");
        json_patch::patch(&mut value, &patch).expect("patch must apply");
        *workload = serde_json::from_value(value).expect("workload must decode");
        self.patches.lock().push(name.to_string());
        Ok(())
    }
}

impl FakeSubjects {
    fn with(workloads: impl IntoIterator<Item = PodSpecable>, failing: &[&str]) -> Self {
        Self {
            workloads: Mutex::new(
                workloads
                    .into_iter()
                    .map(|w| (w.metadata.name.clone().unwrap(), w))
                    .collect(),
            ),
            failing: failing.iter().map(|s| s.to_string()).collect(),
            patches: Default::default(),
        }
    }

    fn volumes(&self, name: &str) -> Vec<String> {
        self.workloads.lock()[name]
            .spec
            .template
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .iter()
            .flat_map(|vs| vs.iter().map(|v| v.name.clone()))
            .collect()
    }

    fn mounts(&self, name: &str) -> Vec<String> {
        self.workloads.lock()[name]
            .spec
            .template
            .spec
            .as_ref()
            .iter()
            .flat_map(|s| s.containers.iter())
            .flat_map(|c| c.volume_mounts.iter().flatten())
            .map(|m| m.mount_path.clone())
            .collect()
    }

    fn env(&self, name: &str) -> Vec<(String, String)> {
        self.workloads.lock()[name]
            .spec
            .template
            .spec
            .as_ref()
            .iter()
            .flat_map(|s| s.containers.iter())
            .flat_map(|c| c.env.iter().flatten())
            .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
            .collect()
    }
}

// === impl FakeBindings ===

#[async_trait]
impl BindingWriter for FakeBindings {
    async fn patch_finalizers(
        &self,
        _: &BindingId,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error> {
        self.finalizers
            .lock()
            .push((resource_version.map(Into::into), finalizers));
        Ok(())
    }

    async fn patch_status(&self, _: &BindingId, status: &BindingStatus) -> Result<(), kube::Error> {
        self.statuses.lock().push(status.clone());
        Ok(())
    }
}

// === impl FakeEvents ===

#[async_trait]
impl EventPublisher for FakeEvents {
    async fn publish(
        &self,
        _: &ObjectReference,
        _: EventType,
        reason: &str,
        _: Option<String>,
    ) {
        self.0.lock().push(reason.to_string());
    }
}

// === impl Harness ===

impl Harness {
    fn new(subjects: FakeSubjects) -> Self {
        Self::with_holder(subjects, HOSTNAME)
    }

    fn with_holder(subjects: FakeSubjects, holder: &str) -> Self {
        let subjects = Arc::new(subjects);
        let bindings = Arc::new(FakeBindings::default());
        let events = Arc::new(FakeEvents::default());
        let tracker = SubjectTracker::shared();
        let claim = kubert::lease::Claim {
            holder: holder.to_string(),
            expiry: DateTime::<Utc>::MAX_UTC,
        };
        let (claims_tx, claims_rx) = watch::channel(Arc::new(claim));
        let ctx = Arc::new(Context::new(
            subjects.clone(),
            bindings.clone(),
            events.clone(),
            tracker.clone(),
            Leadership::new(claims_rx, HOSTNAME.to_string()),
            PARAMS,
            ReconcileMetrics::default(),
        ));
        Self {
            subjects,
            bindings,
            events,
            tracker,
            _claims: claims_tx,
            ctx,
        }
    }

    async fn reconcile<B: Bindable + 'static>(&self, binding: &B) -> Result<Action, Error> {
        reconcile(Arc::new(binding.clone()), self.ctx.clone()).await
    }

    fn last_status(&self) -> BindingStatus {
        self.bindings
            .statuses
            .lock()
            .last()
            .cloned()
            .expect("status must have been written")
    }

    fn events(&self) -> Vec<String> {
        self.events.0.lock().clone()
    }
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} by test"),
        reason: reason.to_string(),
        code,
    })
}

fn workload(name: &str, labels: &[(&str, &str)]) -> PodSpecable {
    serde_json::from_value(serde_json::json!({
        "metadata": {
            "name": name,
            "namespace": "ns-0",
            "labels": labels.iter().cloned().collect::<BTreeMap<_, _>>(),
        },
        "spec": {
            "template": {
                "spec": {
                    "containers": [{ "name": "app", "image": "nginx" }],
                    "volumes": [{ "name": "cache", "emptyDir": {} }],
                }
            }
        }
    }))
    .expect("workload must decode")
}

fn binding(subject: SubjectRef) -> SecretBinding {
    let mut b = SecretBinding::new(
        "db",
        SecretBindingSpec {
            subject,
            secret: SecretRef {
                name: "db-creds".to_string(),
            },
            mount_path: None,
        },
    );
    b.metadata.namespace = Some("ns-0".to_string());
    b.metadata.generation = Some(1);
    b.metadata.resource_version = Some("7".to_string());
    b
}

fn env_binding(subject: SubjectRef) -> EnvBinding {
    let mut b = EnvBinding::new(
        "region",
        EnvBindingSpec {
            subject,
            env: vec![EnvVar {
                name: "REGION".to_string(),
                value: "us-east".to_string(),
            }],
        },
    );
    b.metadata.namespace = Some("ns-0".to_string());
    b.metadata.generation = Some(3);
    b.metadata.resource_version = Some("9".to_string());
    b
}

fn by_name(name: &str) -> SubjectRef {
    SubjectRef {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn by_label(key: &'static str, value: &'static str) -> SubjectRef {
    SubjectRef {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        selector: Some(Selector::from_iter(Some((key, value)))),
        ..Default::default()
    }
}

fn deleting(mut b: SecretBinding, finalizers: &[&str]) -> SecretBinding {
    b.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
    b.metadata.deletion_timestamp =
        serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).ok();
    assert!(b.metadata.deletion_timestamp.is_some());
    b
}

fn ready(status: &BindingStatus) -> (ConditionStatus, Option<String>) {
    let c = status
        .condition(conditions::READY)
        .expect("ready condition");
    (c.status, c.reason.clone())
}

#[tokio::test]
async fn first_reconcile_binds_exact_subject() {
    let h = Harness::new(FakeSubjects::with([workload("web", &[])], &[]));
    let b = binding(by_name("web"));

    let action = h.reconcile(&b).await.expect("reconcile must succeed");
    assert_eq!(action, Action::requeue(PARAMS.resync));

    assert_eq!(
        *h.bindings.finalizers.lock(),
        vec![(Some("7".to_string()), vec![FINALIZER.to_string()])]
    );

    let status = h.last_status();
    assert_eq!(ready(&status), (ConditionStatus::True, None));
    assert_eq!(status.observed_generation, Some(1));

    assert_eq!(h.subjects.volumes("web"), vec!["cache", "secretbinding-db"]);
    assert_eq!(h.subjects.mounts("web"), vec!["/var/bindings/db"]);

    let id = BindingId {
        kind: BindingKind::Secret,
        namespace: "ns-0".to_string(),
        name: "db".to_string(),
    };
    assert!(h.tracker.is_tracked(&id));
}

#[tokio::test]
async fn second_reconcile_is_a_noop() {
    let h = Harness::new(FakeSubjects::with([workload("web", &[])], &[]));
    let mut b = binding(by_name("web"));
    h.reconcile(&b).await.expect("reconcile must succeed");

    b.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    b.status = Some(h.last_status());
    h.reconcile(&b).await.expect("reconcile must succeed");

    assert_eq!(h.bindings.finalizers.lock().len(), 1);
    assert_eq!(h.bindings.statuses.lock().len(), 1);
    assert_eq!(*h.subjects.patches.lock(), vec!["web"]);
}

#[tokio::test]
async fn missing_subject_is_reported() {
    let h = Harness::new(FakeSubjects::default());
    let b = binding(by_name("web"));

    let error = h.reconcile(&b).await.expect_err("reconcile must fail");
    assert!(matches!(error, Error::SubjectMissing { .. }), "{error}");

    let status = h.last_status();
    assert_eq!(
        ready(&status),
        (
            ConditionStatus::False,
            Some(conditions::reasons::SUBJECT_MISSING.to_string())
        )
    );
    assert_eq!(status.observed_generation, None);
    assert_eq!(h.events(), vec!["InternalError"]);
}

#[tokio::test]
async fn failed_pass_keeps_prior_observed_generation() {
    let h = Harness::new(FakeSubjects::with([workload("web", &[])], &[]));
    let mut b = binding(by_name("web"));
    h.reconcile(&b).await.expect("reconcile must succeed");
    assert_eq!(h.last_status().observed_generation, Some(1));

    // The next generation points at a workload that does not exist.
    b.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    b.metadata.generation = Some(2);
    b.spec.subject = by_name("api");
    b.status = Some(h.last_status());
    h.reconcile(&b).await.expect_err("reconcile must fail");

    let status = h.last_status();
    assert_eq!(ready(&status).0, ConditionStatus::False);
    assert_eq!(status.observed_generation, Some(1));
}

#[tokio::test]
async fn env_binding_sets_variables() {
    let h = Harness::new(FakeSubjects::with(
        [
            workload("web", &[("app", "web")]),
            workload("api", &[("app", "api")]),
        ],
        &[],
    ));
    let b = env_binding(by_label("app", "web"));

    let action = h.reconcile(&b).await.expect("reconcile must succeed");
    assert_eq!(action, Action::requeue(PARAMS.resync));

    assert_eq!(
        *h.bindings.finalizers.lock(),
        vec![(
            Some("9".to_string()),
            vec!["envbindings.bindings.podspec.dev".to_string()]
        )]
    );
    let status = h.last_status();
    assert_eq!(ready(&status), (ConditionStatus::True, None));
    assert_eq!(status.observed_generation, Some(3));

    assert_eq!(
        h.subjects.env("web"),
        vec![("REGION".to_string(), "us-east".to_string())]
    );
    assert!(h.subjects.env("api").is_empty());
    assert_eq!(h.subjects.volumes("web"), vec!["cache"]);
    assert_eq!(*h.subjects.patches.lock(), vec!["web"]);
    assert!(h.tracker.is_tracked(&b.id()));

    // Deleting the binding removes the variables it set.
    let mut b = b;
    b.metadata.finalizers = Some(vec!["envbindings.bindings.podspec.dev".to_string()]);
    b.metadata.deletion_timestamp =
        serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).ok();
    let action = h.reconcile(&b).await.expect("finalize must succeed");
    assert_eq!(action, Action::await_change());
    assert!(h.subjects.env("web").is_empty());
    assert!(!h.tracker.is_tracked(&b.id()));
}

#[tokio::test]
async fn malformed_subject_is_reported() {
    let h = Harness::new(FakeSubjects::default());
    let mut subject = by_name("web");
    subject.selector = Some(Selector::default());
    let b = binding(subject);

    let error = h.reconcile(&b).await.expect_err("reconcile must fail");
    assert!(matches!(error, Error::MalformedSubject(_)), "{error}");
    assert_eq!(
        ready(&h.last_status()),
        (
            ConditionStatus::False,
            Some(conditions::reasons::MALFORMED_SUBJECT.to_string())
        )
    );
}

#[tokio::test]
async fn empty_selector_match_is_ready() {
    let h = Harness::new(FakeSubjects::with([workload("web", &[("app", "web")])], &[]));
    let b = binding(by_label("app", "api"));

    h.reconcile(&b).await.expect("reconcile must succeed");
    assert_eq!(ready(&h.last_status()), (ConditionStatus::True, None));
    assert!(h.subjects.patches.lock().is_empty());
}

#[tokio::test]
async fn one_failed_subject_does_not_roll_back_others() {
    let h = Harness::new(FakeSubjects::with(
        [
            workload("a", &[("app", "web")]),
            workload("b", &[("app", "web")]),
            workload("c", &[("app", "web")]),
        ],
        &["b"],
    ));
    let b = binding(by_label("app", "web"));

    let error = h.reconcile(&b).await.expect_err("reconcile must fail");
    assert!(matches!(error, Error::Patch { ref name, .. } if name == "b"), "{error}");

    let (status, reason) = ready(&h.last_status());
    assert_eq!(status, ConditionStatus::False);
    assert_eq!(
        reason.as_deref(),
        Some(conditions::reasons::BINDING_FAILED)
    );

    assert_eq!(h.subjects.volumes("a"), vec!["cache", "secretbinding-db"]);
    assert_eq!(h.subjects.volumes("b"), vec!["cache"]);
    assert_eq!(h.subjects.volumes("c"), vec!["cache", "secretbinding-db"]);
}

#[tokio::test]
async fn deletion_undoes_and_removes_finalizer() {
    let h = Harness::new(FakeSubjects::with([workload("web", &[])], &[]));
    let b = binding(by_name("web"));
    h.reconcile(&b).await.expect("reconcile must succeed");
    assert_eq!(h.subjects.volumes("web"), vec!["cache", "secretbinding-db"]);

    let b = deleting(b, &["other.example.com", FINALIZER]);
    let action = h.reconcile(&b).await.expect("finalize must succeed");
    assert_eq!(action, Action::await_change());

    assert_eq!(h.subjects.volumes("web"), vec!["cache"]);
    assert!(h.subjects.mounts("web").is_empty());
    assert_eq!(
        h.bindings.finalizers.lock().last().cloned(),
        Some((None, vec!["other.example.com".to_string()]))
    );
    assert_eq!(
        ready(&h.last_status()),
        (
            ConditionStatus::Unknown,
            Some(conditions::reasons::FINALIZING.to_string())
        )
    );
    assert_eq!(h.events(), vec!["FinalizerRemoved"]);
    assert!(!h.tracker.is_tracked(&b.id()));
}

#[tokio::test]
async fn deletion_with_missing_subject_succeeds() {
    let h = Harness::new(FakeSubjects::default());
    let b = deleting(binding(by_name("web")), &[FINALIZER]);

    let action = h.reconcile(&b).await.expect("finalize must succeed");
    assert_eq!(action, Action::await_change());
    assert_eq!(
        *h.bindings.finalizers.lock(),
        vec![(None, Vec::<String>::new())]
    );
    assert!(h.subjects.patches.lock().is_empty());
}

#[tokio::test]
async fn deletion_failure_keeps_finalizer() {
    let h = Harness::new(FakeSubjects::with([workload("web", &[])], &[]));
    let b = binding(by_name("web"));
    h.reconcile(&b).await.expect("reconcile must succeed");

    let h2 = Harness::new(FakeSubjects::with(
        [h.subjects.workloads.lock()["web"].clone()],
        &["web"],
    ));
    let b = deleting(b, &[FINALIZER]);
    h2.reconcile(&b).await.expect_err("finalize must fail");
    assert!(h2.bindings.finalizers.lock().is_empty());
}

#[tokio::test]
async fn deletion_without_finalizer_is_ignored() {
    let h = Harness::new(FakeSubjects::with([workload("web", &[])], &[]));
    let b = deleting(binding(by_name("web")), &[]);

    let action = h.reconcile(&b).await.expect("reconcile must succeed");
    assert_eq!(action, Action::await_change());
    assert!(h.bindings.finalizers.lock().is_empty());
    assert!(h.bindings.statuses.lock().is_empty());
}

#[tokio::test]
async fn followers_do_not_reconcile() {
    let h = Harness::with_holder(FakeSubjects::with([workload("web", &[])], &[]), "other");
    let b = binding(by_name("web"));

    let action = h.reconcile(&b).await.expect("reconcile must succeed");
    assert_eq!(action, Action::requeue(PARAMS.resync));
    assert!(h.bindings.finalizers.lock().is_empty());
    assert!(h.subjects.patches.lock().is_empty());
}

#[tokio::test]
async fn failures_back_off_exponentially() {
    let h = Harness::new(FakeSubjects::default());
    let b = Arc::new(binding(by_name("web")));
    let error = Error::SubjectMissing {
        subject: "web".to_string(),
    };

    let delays = (0..5)
        .map(|_| error_policy(b.clone(), &error, h.ctx.clone()))
        .collect::<Vec<_>>();
    assert_eq!(
        delays,
        [1, 2, 4, 8, 8]
            .into_iter()
            .map(|s| Action::requeue(Duration::from_secs(s)))
            .collect::<Vec<_>>()
    );

    // A successful pass resets the backoff.
    h.subjects
        .workloads
        .lock()
        .insert("web".to_string(), workload("web", &[]));
    h.reconcile(&*b).await.expect("reconcile must succeed");
    assert_eq!(
        error_policy(b.clone(), &error, h.ctx.clone()),
        Action::requeue(Duration::from_secs(1))
    );
}
