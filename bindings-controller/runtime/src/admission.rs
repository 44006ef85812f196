use crate::{
    core::{BindingId, BindingKind, GroupKind},
    index::Dispatch,
    k8s::{
        binding::{EnvBindingSpec, SecretBindingSpec},
        EnvBinding, Labels, PodSpecable, Resource, ResourceExt, SecretBinding,
    },
    validation,
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission::Operation, DynamicObject};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Serves the mutating webhook for bound workloads and the validating
/// webhook for binding resources.
#[derive(Clone)]
pub struct Admission {
    dispatch: Dispatch,
    paths: Arc<Paths>,
    metrics: AdmissionMetrics,
}

#[derive(Clone, Debug)]
pub struct Paths {
    pub mutate: String,
    pub validate: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default)]
pub struct AdmissionMetrics {
    requests: Family<AdmissionLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AdmissionLabels {
    webhook: &'static str,
    result: &'static str,
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

trait Validate<T> {
    fn validate(&self, id: &BindingId, spec: T) -> Result<()>;
}

type Body = http_body_util::Full<bytes::Bytes>;

#[derive(Copy, Clone, Debug)]
enum Webhook {
    Mutate,
    Validate,
}

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let webhook = match (req.method(), req.uri().path()) {
            (&http::Method::POST, path) if path == self.paths.mutate => Webhook::Mutate,
            (&http::Method::POST, path) if path == self.paths.validate => Webhook::Validate,
            _ => {
                return Box::pin(future::ok(
                    Response::builder()
                        .status(http::StatusCode::NOT_FOUND)
                        .body(Body::default())
                        .expect("not found response must be valid"),
                ))
            }
        };

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(webhook, req)
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(dispatch: Dispatch, paths: Paths, metrics: AdmissionMetrics) -> Self {
        Self {
            dispatch,
            paths: Arc::new(paths),
            metrics,
        }
    }

    fn admit(&self, webhook: Webhook, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = match webhook {
            Webhook::Mutate => self.mutate(req),
            Webhook::Validate => self.admit_binding(req),
        };
        self.metrics.observe(webhook, &rsp);
        rsp
    }

    /// Applies the mutation of every matching binding, one per kind, to a
    /// workload as it is created or updated.
    ///
    /// Only an undecodable workload is denied; a binding that cannot be
    /// applied never blocks the workload.
    fn mutate(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return rsp;
        }

        let workload = match parse_workload(&req) {
            Ok(workload) => workload,
            Err(error) => {
                info!(%error, kind = %req.kind.kind, "Failed to decode workload");
                return rsp.deny(error);
            }
        };

        let group_kind = GroupKind::new(req.kind.group.clone(), req.kind.kind.clone());
        let namespace = req
            .namespace
            .clone()
            .or_else(|| workload.metadata.namespace.clone())
            .unwrap_or_default();
        let name = workload
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| req.name.clone());
        let labels = Labels::from(workload.metadata.labels.clone());

        let bindings = self
            .dispatch
            .lookup(&group_kind, &namespace, &name, &labels);
        if bindings.is_empty() {
            trace!(%group_kind, %namespace, %name, "No binding");
            return rsp;
        }

        // Each kind's mutation touches only its own volumes or variables, so
        // the matched bindings compose in any order.
        let mut desired = workload.clone();
        for binding in &bindings {
            if workload.is_deleting() {
                binding.mutation.undo(&mut desired);
            } else {
                binding.mutation.apply(&mut desired);
            }
        }

        let patch = match (
            serde_json::to_value(&workload),
            serde_json::to_value(&desired),
        ) {
            (Ok(original), Ok(desired)) => json_patch::diff(&original, &desired),
            (Err(error), _) | (_, Err(error)) => {
                warn!(%error, %namespace, %name, "Failed to encode workload");
                return rsp;
            }
        };
        if patch.0.is_empty() {
            debug!(%namespace, %name, "Workload already bound");
            return rsp;
        }

        for binding in &bindings {
            debug!(binding = %binding.id, %namespace, %name, "Patching workload");
        }
        match rsp.with_patch(patch) {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(%error, %namespace, %name, "Failed to encode patch");
                AdmissionResponse::from(&req)
            }
        }
    }

    fn admit_binding(&self, req: AdmissionRequest) -> AdmissionResponse {
        if is_kind::<SecretBinding>(&req) {
            return self.admit_spec::<SecretBindingSpec>(BindingKind::Secret, req);
        }

        if is_kind::<EnvBinding>(&req) {
            return self.admit_spec::<EnvBindingSpec>(BindingKind::Env, req);
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    fn admit_spec<T>(&self, kind: BindingKind, req: AdmissionRequest) -> AdmissionResponse
    where
        T: DeserializeOwned,
        Self: Validate<T>,
    {
        let rsp = AdmissionResponse::from(&req);
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return rsp;
        }

        let (obj, spec) = match parse_spec::<T>(req) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, %kind, "Failed to parse spec");
                return rsp.deny(error);
            }
        };

        let id = BindingId {
            kind,
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        };
        if let Err(error) = self.validate(&id, spec) {
            info!(%error, binding = %id, "Denied");
            return rsp.deny(error);
        }

        rsp
    }

    /// Denies a binding whose exact subject is already held by another
    /// binding of the same kind.
    fn check_claim(&self, id: &BindingId, subject: &crate::core::Subject) -> Result<()> {
        let Some(name) = subject.name() else {
            return Ok(());
        };
        let snapshot = self.dispatch.snapshot();
        match snapshot.exact_claim(id.kind, &subject.group_kind, &subject.namespace, name) {
            Some(holder) if holder != id => Err(anyhow!("subject {subject} is already bound by {holder}")),
            _ => Ok(()),
        }
    }
}

impl Validate<SecretBindingSpec> for Admission {
    fn validate(&self, id: &BindingId, spec: SecretBindingSpec) -> Result<()> {
        let subject = validation::validate_subject(&spec.subject, &id.namespace)?;
        validation::validate_secret(&spec)?;
        self.check_claim(id, &subject)
    }
}

impl Validate<EnvBindingSpec> for Admission {
    fn validate(&self, id: &BindingId, spec: EnvBindingSpec) -> Result<()> {
        let subject = validation::validate_subject(&spec.subject, &id.namespace)?;
        validation::validate_env(&spec)?;
        self.check_claim(id, &subject)
    }
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let requests = Family::default();
        prom.register(
            "requests",
            "Count of admission requests by webhook and result",
            requests.clone(),
        );
        Self { requests }
    }

    fn observe(&self, webhook: Webhook, rsp: &AdmissionResponse) {
        let result = if !rsp.allowed {
            "denied"
        } else if rsp.patch.is_some() {
            "patched"
        } else {
            "allowed"
        };
        let webhook = match webhook {
            Webhook::Mutate => "mutate",
            Webhook::Validate => "validate",
        };
        self.requests
            .get_or_create(&AdmissionLabels { webhook, result })
            .inc();
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_workload(req: &AdmissionRequest) -> Result<PodSpecable> {
    let obj = req
        .object
        .as_ref()
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    let workload = serde_json::from_value(serde_json::to_value(obj)?)?;
    Ok(workload)
}

fn parse_spec<T: DeserializeOwned>(req: AdmissionRequest) -> Result<(DynamicObject, T)> {
    let obj = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;

    let spec = {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
        serde_json::from_value(data)?
    };

    Ok((obj, spec))
}
