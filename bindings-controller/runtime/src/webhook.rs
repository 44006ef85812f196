//! Keeps the mutating webhook configuration's rules in step with the
//! binding set.

use crate::{
    index::{Rule, SharedStore},
    k8s::{
        binding::EXCLUDE_LABEL, Api, ByteString, Client, LabelSelector, LabelSelectorRequirement,
        MutatingWebhookConfiguration, PostParams, Secret,
    },
    reconcile::Leadership,
};
use anyhow::Result;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use thiserror::Error;
use tokio::{sync::watch, time};
use tracing::{debug, info, info_span, warn, Instrument};

/// The key of the webhook secret that holds the CA bundle.
pub const CA_KEY: &str = "ca-cert.pem";

pub struct Webhook {
    client: Client,
    store: SharedStore,
    changes: watch::Receiver<()>,
    leadership: Leadership,
    config: Config,
    metrics: WebhookMetrics,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Names both the configuration and the webhook entries it manages.
    pub name: String,
    pub path: String,
    pub secret_namespace: String,
    pub secret_name: String,
    pub resync: time::Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("webhook {0} has no service reference")]
    MissingService(String),

    #[error("secret {0} has no ca-cert.pem entry")]
    MissingCa(String),
}

#[derive(Clone, Debug, Default)]
pub struct WebhookMetrics {
    updates: Counter,
    errors: Counter,
}

// === impl Webhook ===

impl Webhook {
    pub fn new(
        client: Client,
        store: SharedStore,
        changes: watch::Receiver<()>,
        leadership: Leadership,
        config: Config,
        metrics: WebhookMetrics,
    ) -> Self {
        Self {
            client,
            store,
            changes,
            leadership,
            config,
            metrics,
        }
    }

    /// Rewrites the configuration whenever the binding set changes and on
    /// every resync, until shutdown. Only the leader writes, and only once
    /// the binding store has synced.
    pub async fn run(mut self, drain: drain::Watch) {
        let mut resync = time::interval(self.config.resync);
        resync.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                release = &mut shutdown => {
                    debug!("Shutting down");
                    drop(release);
                    return;
                }
                res = self.changes.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
                _ = resync.tick() => {}
            }

            if !self.leadership.is_leader() {
                continue;
            }

            // Rules rendered from a partial binding set would drop
            // interception for the kinds still being listed.
            if !self.store.read().is_synced() {
                debug!("Waiting for bindings to sync");
                continue;
            }

            let span = info_span!("webhook", name = %self.config.name);
            if let Err(error) = self.reconcile().instrument(span).await {
                self.metrics.errors.inc();
                warn!(%error, name = %self.config.name, "Failed to update webhook configuration");
            }
        }
    }

    async fn reconcile(&self) -> Result<()> {
        let rules = self.store.read().rules();

        let api = Api::<MutatingWebhookConfiguration>::all(self.client.clone());
        let Some(current) = api.get_opt(&self.config.name).await? else {
            warn!("Webhook configuration not found");
            return Ok(());
        };

        let secret = Api::<Secret>::namespaced(self.client.clone(), &self.config.secret_namespace)
            .get(&self.config.secret_name)
            .await?;
        let ca = secret
            .data
            .and_then(|mut data| data.remove(CA_KEY))
            .ok_or_else(|| WebhookError::MissingCa(self.config.secret_name.clone()))?;

        let Some(desired) = desired_configuration(&current, &rules, &ca, &self.config)? else {
            debug!("Webhook configuration is current");
            return Ok(());
        };
        api.replace(&self.config.name, &PostParams::default(), &desired)
            .await?;
        self.metrics.updates.inc();
        info!(rules = rules.len(), "Updated webhook configuration");
        Ok(())
    }
}

/// Computes the configuration the API server should hold, or `None` if
/// `current` already matches it.
pub fn desired_configuration(
    current: &MutatingWebhookConfiguration,
    rules: &[Rule],
    ca: &ByteString,
    config: &Config,
) -> Result<Option<MutatingWebhookConfiguration>, WebhookError> {
    let mut desired = current.clone();
    desired.metadata.owner_references = None;

    for webhook in desired.webhooks.iter_mut().flatten() {
        if webhook.name != config.name {
            continue;
        }

        let service = webhook
            .client_config
            .service
            .as_mut()
            .ok_or_else(|| WebhookError::MissingService(webhook.name.clone()))?;
        service.path = Some(config.path.clone());
        webhook.client_config.ca_bundle = Some(ca.clone());

        webhook.match_policy = Some("Equivalent".to_string());
        webhook.rules = Some(rules.iter().map(Rule::to_webhook_rule).collect());
        webhook.namespace_selector = Some(exclude_selector());
        webhook.object_selector = Some(exclude_selector());
    }

    if desired == *current {
        return Ok(None);
    }
    Ok(Some(desired))
}

fn exclude_selector() -> LabelSelector {
    LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: EXCLUDE_LABEL.to_string(),
            operator: "NotIn".to_string(),
            values: Some(vec!["true".to_string()]),
        }]),
        match_labels: None,
    }
}

// === impl WebhookMetrics ===

impl WebhookMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let updates = Counter::default();
        prom.register(
            "updates",
            "Count of webhook configuration updates",
            updates.clone(),
        );
        let errors = Counter::default();
        prom.register(
            "errors",
            "Count of failed webhook configuration updates",
            errors.clone(),
        );
        Self { updates, errors }
    }
}
