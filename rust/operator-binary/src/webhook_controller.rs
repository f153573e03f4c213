//! Keeps our entries of the [`ValidatingWebhookConfiguration`] pointed at the webhook Service,
//! trusting the current CA

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use const_format::concatcp;
use futures::StreamExt;
use snafu::{ensure, ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            admissionregistration::v1::{ServiceReference, ValidatingWebhookConfiguration},
            core::v1::Secret,
        },
        ByteString,
    },
    kube::{
        self,
        runtime::{
            controller::{self, Action},
            events::{Recorder, Reporter},
            reflector::ObjectRef,
            watcher, Controller,
        },
        Api, ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use crate::{
    backoff::Backoff,
    cert_store::CredentialStore,
    k8s::ApiError,
    readiness::{self, LeaderGate, NotReady, ReadinessCheck, ReadinessState},
    WebhookDeployment, OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "webhook-inject";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

/// Only configurations carrying this label are managed by us
pub const COMPONENT_LABEL_KEY: &str = "secret-sync.io/component";
pub const COMPONENT_LABEL_VALUE: &str = "webhook";
/// Only webhook entries whose name ends with this suffix are managed by us
pub const WEBHOOK_NAME_SUFFIX: &str = "secret-sync.io";

const CA_NOT_READY_REQUEUE: Duration = Duration::from_secs(60);

/// Access to [`ValidatingWebhookConfiguration`]s and the health of the Service they point at.
#[async_trait]
pub trait WebhookConfigApi: Send + Sync {
    async fn get_webhook_config(&self, name: &str)
        -> Result<ValidatingWebhookConfiguration, ApiError>;

    /// Fails with [`ApiError::Conflict`] if the configuration was modified since it was read.
    async fn replace_webhook_config(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<(), ApiError>;

    /// Whether the Service has at least one ready endpoint to route requests to.
    async fn has_ready_endpoints(
        &self,
        service_name: &str,
        service_namespace: &str,
    ) -> Result<bool, ApiError>;
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get {config}"))]
    GetWebhookConfig {
        source: ApiError,
        config: ObjectRef<ValidatingWebhookConfiguration>,
    },

    #[snafu(display("failed to get webhook credentials from {secret}"))]
    GetCredentials {
        source: ApiError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("CA not yet ready: {secret} does not contain a CA certificate"))]
    CaNotReady { secret: ObjectRef<Secret> },

    #[snafu(display("failed to update {config}"))]
    UpdateWebhookConfig {
        source: ApiError,
        config: ObjectRef<ValidatingWebhookConfiguration>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<kube::api::DynamicObject>> {
        match self {
            Error::GetWebhookConfig { .. } => None,
            Error::GetCredentials { secret, .. } => Some(secret.clone().erase()),
            Error::CaNotReady { secret } => Some(secret.clone().erase()),
            Error::UpdateWebhookConfig { .. } => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The configuration does not exist (yet)
    ConfigMissing,
    /// The configuration is not labelled as ours, and was left alone
    NotOwned,
    Reconciled {
        /// Whether the configuration had to be written
        updated: bool,
    },
}

/// Injects the webhook Service reference and CA bundle into our webhook entries.
pub struct WebhookReconciler {
    pub store: Arc<dyn CredentialStore>,
    pub api: Arc<dyn WebhookConfigApi>,
    pub deployment: WebhookDeployment,
    pub config_name: String,
    pub readiness: Arc<ReadinessState>,
}

impl WebhookReconciler {
    pub async fn reconcile_webhook_config(&self) -> Result<Outcome> {
        let config_ref = ObjectRef::<ValidatingWebhookConfiguration>::new(&self.config_name);
        let original = match self.api.get_webhook_config(&self.config_name).await {
            Ok(config) => config,
            Err(err) if err.is_not_found() => return Ok(Outcome::ConfigMissing),
            Err(source) => {
                return Err(Error::GetWebhookConfig {
                    source,
                    config: config_ref,
                })
            }
        };
        if !is_owned(&original) {
            debug!(config = %config_ref, "not labelled as ours, skipping");
            return Ok(Outcome::NotOwned);
        }

        let secret_ref = self.deployment.secret_ref();
        let record = match self
            .store
            .get(&self.deployment.secret_name, &self.deployment.secret_namespace)
            .await
        {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return CaNotReadySnafu { secret: secret_ref }.fail(),
            Err(source) => {
                return Err(Error::GetCredentials {
                    source,
                    secret: secret_ref,
                })
            }
        };
        let Some(ca_cert) = record.ca_cert else {
            return CaNotReadySnafu { secret: secret_ref }.fail();
        };

        let mut config = original.clone();
        for webhook in config
            .webhooks
            .iter_mut()
            .flatten()
            .filter(|webhook| webhook.name.ends_with(WEBHOOK_NAME_SUFFIX))
        {
            let client_config = &mut webhook.client_config;
            let service = client_config
                .service
                .get_or_insert_with(ServiceReference::default);
            service.name.clone_from(&self.deployment.service_name);
            service.namespace.clone_from(&self.deployment.service_namespace);
            client_config.ca_bundle = Some(ByteString(ca_cert.clone()));
        }

        let updated = config != original;
        if updated {
            self.api
                .replace_webhook_config(&config)
                .await
                .with_context(|_| UpdateWebhookConfigSnafu {
                    config: config_ref.clone(),
                })?;
            info!(config = %config_ref, "injected webhook service and CA bundle");
        }
        self.readiness.mark_ready();
        Ok(Outcome::Reconciled { updated })
    }
}

fn is_owned(config: &ValidatingWebhookConfiguration) -> bool {
    config
        .labels()
        .get(COMPONENT_LABEL_KEY)
        .is_some_and(|value| value == COMPONENT_LABEL_VALUE)
}

/// Like [`crate::crd_controller::CrdReadiness`], but also requires the webhook Service to be
/// backed by a ready endpoint.
pub struct WebhookReadiness {
    pub leader: Arc<LeaderGate>,
    pub state: Arc<ReadinessState>,
    pub api: Arc<dyn WebhookConfigApi>,
    pub service_name: String,
    pub service_namespace: String,
}

#[async_trait]
impl ReadinessCheck for WebhookReadiness {
    async fn check(&self) -> Result<(), NotReady> {
        if !self.leader.is_leader() {
            return Ok(());
        }
        ensure!(self.state.is_ready(), readiness::NotReconciledSnafu);
        let service = format!("{}.{}", self.service_name, self.service_namespace);
        let has_endpoints = self
            .api
            .has_ready_endpoints(&self.service_name, &self.service_namespace)
            .await
            .with_context(|_| readiness::EndpointLookupSnafu {
                service: service.clone(),
            })?;
        ensure!(has_endpoints, readiness::NoReadyEndpointsSnafu { service });
        Ok(())
    }
}

pub struct Ctx {
    pub reconciler: WebhookReconciler,
    pub requeue_interval: Duration,
    pub backoff: Backoff,
}

pub async fn start(client: kube::Client, ctx: Ctx, concurrency: u16) {
    let deployment = &ctx.reconciler.deployment;
    let secrets = Api::<Secret>::namespaced(client.clone(), &deployment.secret_namespace);
    let secret_selector =
        watcher::Config::default().fields(&format!("metadata.name={}", deployment.secret_name));
    let config_name = ctx.reconciler.config_name.clone();
    let config_selector =
        watcher::Config::default().fields(&format!("metadata.name={config_name}"));
    let event_recorder = Arc::new(Recorder::new(
        client.clone(),
        Reporter {
            controller: FULL_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    Controller::new(
        Api::<ValidatingWebhookConfiguration>::all(client),
        config_selector,
    )
    .with_config(controller::Config::default().concurrency(concurrency))
    .watches(secrets, secret_selector, move |_secret| {
        [ObjectRef::new(&config_name)]
    })
    .run(reconcile, error_policy, Arc::new(ctx))
    .for_each_concurrent(16, move |res| {
        let event_recorder = event_recorder.clone();
        async move {
            report_controller_reconciled(&event_recorder, FULL_CONTROLLER_NAME, &res).await
        }
    })
    .await;
}

async fn reconcile(_config: Arc<ValidatingWebhookConfiguration>, ctx: Arc<Ctx>) -> Result<Action> {
    ctx.reconciler.reconcile_webhook_config().await?;
    ctx.backoff.reset(&ctx.reconciler.config_name);
    Ok(Action::requeue(ctx.requeue_interval))
}

fn error_policy(
    _config: Arc<ValidatingWebhookConfiguration>,
    error: &Error,
    ctx: Arc<Ctx>,
) -> Action {
    match error {
        // Expected to be resolved shortly by the CRD controller provisioning the credentials
        Error::CaNotReady { .. } => Action::requeue(CA_NOT_READY_REQUEUE),
        _ => Action::requeue(ctx.backoff.next_delay(&ctx.reconciler.config_name)),
    }
}
