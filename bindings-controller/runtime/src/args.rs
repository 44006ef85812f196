use crate::{
    admission::{Admission, AdmissionMetrics, Paths},
    controller,
    index::{BindingStore, Dispatch, IndexMetrics, SubjectTracker},
    k8s::{EnvBinding, SecretBinding},
    lease,
    reconcile::{
        self, KubeBindings, KubeEventPublisher, KubeSubjects, Leadership, ReconcileMetrics,
    },
    webhook::{self, Webhook, WebhookMetrics},
};
use anyhow::{bail, Context as _, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

const FIELD_MANAGER: &str = "bindings-controller";

#[derive(Debug, Parser)]
#[clap(
    name = "bindings-controller",
    about = "Binds secrets and environment to workload pod templates"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "bindings=info,warn",
        env = "BINDINGS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission webhook server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The name of the MutatingWebhookConfiguration and of its managed
    /// webhook entries.
    #[clap(long, default_value = "bindings.podspec.dev")]
    webhook_name: String,

    #[clap(long, default_value = "/mutate")]
    webhook_path: String,

    #[clap(long, default_value = "/validate")]
    validating_path: String,

    /// The secret holding the webhook's CA bundle.
    #[clap(long, default_value = "bindings-controller-webhook-certs")]
    webhook_secret: String,

    #[clap(long, default_value = "bindings-system")]
    controller_namespace: String,

    #[clap(long, default_value = "bindings-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "bindings-controller-write")]
    lease_name: String,

    #[clap(long, default_value = "300")]
    resync_period_secs: u64,

    #[clap(long, default_value = "500")]
    backoff_min_ms: u64,

    #[clap(long, default_value = "300")]
    backoff_max_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            webhook_name,
            webhook_path,
            validating_path,
            webhook_secret,
            controller_namespace,
            controller_deployment_name,
            lease_name,
            resync_period_secs,
            backoff_min_ms,
            backoff_max_secs,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };
        let resync = Duration::from_secs(resync_period_secs);

        let mut prom = <Registry>::default();
        let index_metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let webhook_metrics =
            WebhookMetrics::register(prom.sub_registry_with_prefix("webhook_configuration"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("Failed to fetch `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &lease_name,
            &controller_deployment_name,
            &hostname,
        )
        .await?;
        let leadership = Leadership::new(claims, hostname.clone());

        // Every replica indexes the bindings so that any of them can serve
        // admission requests.
        let dispatch = Dispatch::default();
        let (store, changes) = BindingStore::shared(dispatch.clone(), index_metrics);

        let secret_bindings = runtime.watch_all::<SecretBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(store.clone(), secret_bindings)
                .instrument(info_span!("secretbindings")),
        );

        let env_bindings = runtime.watch_all::<EnvBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(store.clone(), env_bindings)
                .instrument(info_span!("envbindings")),
        );

        let client = runtime.client();
        let webhook = Webhook::new(
            client.clone(),
            store,
            changes,
            leadership.clone(),
            webhook::Config {
                name: webhook_name,
                path: webhook_path.clone(),
                secret_namespace: controller_namespace,
                secret_name: webhook_secret,
                resync,
            },
            webhook_metrics,
        );
        tokio::spawn(
            webhook
                .run(runtime.shutdown_handle())
                .instrument(info_span!("webhook_configuration")),
        );

        let tracker = SubjectTracker::shared();
        let ctx = Arc::new(reconcile::Context::new(
            Arc::new(KubeSubjects::new(client.clone(), FIELD_MANAGER)),
            Arc::new(KubeBindings::new(client.clone(), FIELD_MANAGER)),
            Arc::new(KubeEventPublisher::new(
                client.clone(),
                FIELD_MANAGER,
                Some(hostname),
            )),
            tracker.clone(),
            leadership,
            reconcile::Params {
                resync,
                backoff_min: Duration::from_millis(backoff_min_ms),
                backoff_max: Duration::from_secs(backoff_max_secs),
            },
            reconcile_metrics,
        ));
        tokio::spawn(
            controller::run::<SecretBinding>(
                client.clone(),
                tracker.clone(),
                ctx.clone(),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("secretbinding_controller")),
        );
        tokio::spawn(
            controller::run::<EnvBinding>(client, tracker, ctx, runtime.shutdown_handle())
                .instrument(info_span!("envbinding_controller")),
        );

        let admission = Admission::new(
            dispatch,
            Paths {
                mutate: webhook_path,
                validate: validating_path,
            },
            admission_metrics,
        );
        let runtime = runtime.spawn_server(move || admission.clone());
        info!("Started");

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
