//! Keeps the conversion webhook of our CustomResourceDefinitions pointed at the webhook Service,
//! trusting the current CA

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use const_format::concatcp;
use futures::StreamExt;
use snafu::{ensure, OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::Secret,
        apiextensions_apiserver::pkg::apis::apiextensions::v1::{
            CustomResourceDefinition, ServiceReference,
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
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    backoff::Backoff,
    cert_store::{
        self, refresh_credentials, CredentialStore, Refreshed, RestartRequested, RotationPolicy,
    },
    k8s::ApiError,
    readiness::{self, LeaderGate, NotReady, ReadinessCheck, ReadinessState},
    WebhookDeployment, OPERATOR_NAME,
};

const CONTROLLER_NAME: &str = "crd-inject";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

/// Access to cluster-scoped [`CustomResourceDefinition`]s.
#[async_trait]
pub trait CrdApi: Send + Sync {
    async fn get_crd(&self, name: &str) -> Result<CustomResourceDefinition, ApiError>;

    /// Fails with [`ApiError::Conflict`] if the CRD was modified since it was read.
    async fn replace_crd(&self, crd: &CustomResourceDefinition) -> Result<(), ApiError>;
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get webhook credentials from {secret}"))]
    GetCredentials {
        source: ApiError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to get {crd}"))]
    GetCrd {
        source: ApiError,
        crd: ObjectRef<CustomResourceDefinition>,
    },

    #[snafu(display("{crd} has no conversion webhook client config (spec.conversion.webhook.clientConfig)"))]
    MissingConversionWebhook {
        crd: ObjectRef<CustomResourceDefinition>,
    },

    #[snafu(display("failed to refresh webhook credentials"))]
    RefreshCredentials { source: cert_store::Error },

    #[snafu(display("failed to update {crd}"))]
    UpdateCrd {
        source: ApiError,
        crd: ObjectRef<CustomResourceDefinition>,
        /// The credentials were already rotated and saved before the update failed
        restart: Option<RestartRequested>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Restart that is still owed even though the reconcile failed.
    pub fn restart_requested(&self) -> Option<RestartRequested> {
        match self {
            Error::UpdateCrd { restart, .. } => *restart,
            _ => None,
        }
    }
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<kube::api::DynamicObject>> {
        match self {
            Error::GetCredentials { secret, .. } => Some(secret.clone().erase()),
            Error::GetCrd { .. } => None,
            Error::MissingConversionWebhook { .. } => None,
            Error::RefreshCredentials { source } => match source {
                cert_store::Error::SaveCredentials { secret, .. } => Some(secret.clone().erase()),
                _ => None,
            },
            Error::UpdateCrd { .. } => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The credentials Secret has not been provisioned yet, nothing to inject
    CredentialsMissing,
    /// The CRD was deleted before we got to it
    CrdMissing,
    Reconciled {
        credentials: Refreshed,
        /// Whether the CRD had to be written
        updated: bool,
        restart: Option<RestartRequested>,
    },
}

/// Injects the webhook Service reference and CA bundle into a single CRD.
pub struct CrdReconciler {
    pub store: Arc<dyn CredentialStore>,
    pub api: Arc<dyn CrdApi>,
    pub deployment: WebhookDeployment,
    pub rotation: RotationPolicy,
    pub restart_on_refresh: bool,
    pub readiness: Arc<ReadinessState>,
}

impl CrdReconciler {
    pub async fn reconcile_crd(&self, crd_name: &str, now: OffsetDateTime) -> Result<Outcome> {
        let secret_ref = self.deployment.secret_ref();
        let mut record = match self
            .store
            .get(&self.deployment.secret_name, &self.deployment.secret_namespace)
            .await
        {
            Ok(record) => record,
            Err(err) if err.is_not_found() => {
                debug!(secret = %secret_ref, "credentials have not been provisioned yet, skipping");
                return Ok(Outcome::CredentialsMissing);
            }
            Err(source) => {
                return Err(Error::GetCredentials {
                    source,
                    secret: secret_ref,
                })
            }
        };

        let crd_ref = ObjectRef::<CustomResourceDefinition>::new(crd_name);
        let original = match self.api.get_crd(crd_name).await {
            Ok(crd) => crd,
            Err(err) if err.is_not_found() => return Ok(Outcome::CrdMissing),
            Err(source) => {
                return Err(Error::GetCrd {
                    source,
                    crd: crd_ref,
                })
            }
        };
        let mut crd = original.clone();
        let client_config = crd
            .spec
            .conversion
            .as_mut()
            .and_then(|conversion| conversion.webhook.as_mut())
            .and_then(|webhook| webhook.client_config.as_mut())
            .with_context(|| MissingConversionWebhookSnafu {
                crd: crd_ref.clone(),
            })?;

        let service = client_config
            .service
            .get_or_insert_with(ServiceReference::default);
        service.name.clone_from(&self.deployment.service_name);
        service.namespace.clone_from(&self.deployment.service_namespace);

        let credentials = refresh_credentials(self.store.as_ref(), &mut record, &self.rotation, now)
            .await
            .context(RefreshCredentialsSnafu)?;
        client_config.ca_bundle = record.ca_cert.clone().map(ByteString);
        // Owed from here on, the rotated credentials are already persisted
        let restart =
            (self.restart_on_refresh && credentials.rotated()).then_some(RestartRequested);

        let updated = crd != original;
        if updated {
            self.api
                .replace_crd(&crd)
                .await
                .with_context(|_| UpdateCrdSnafu {
                    crd: crd_ref.clone(),
                    restart,
                })?;
            info!(crd = %crd_ref, "injected webhook service and CA bundle");
        }
        self.readiness.mark_ready();
        Ok(Outcome::Reconciled {
            credentials,
            updated,
            restart,
        })
    }
}

/// Ready once the first CRD was reconciled, or unconditionally while we are not the leader.
pub struct CrdReadiness {
    pub leader: Arc<LeaderGate>,
    pub state: Arc<ReadinessState>,
}

#[async_trait]
impl ReadinessCheck for CrdReadiness {
    async fn check(&self) -> Result<(), NotReady> {
        if !self.leader.is_leader() {
            return Ok(());
        }
        ensure!(self.state.is_ready(), readiness::NotReconciledSnafu);
        Ok(())
    }
}

pub struct Ctx {
    pub reconciler: CrdReconciler,
    pub crd_names: BTreeSet<String>,
    pub requeue_interval: Duration,
    pub restart: mpsc::UnboundedSender<RestartRequested>,
    pub backoff: Backoff,
}

pub async fn start(client: kube::Client, ctx: Ctx, concurrency: u16) {
    let deployment = &ctx.reconciler.deployment;
    let secrets = Api::<Secret>::namespaced(client.clone(), &deployment.secret_namespace);
    let secret_selector =
        watcher::Config::default().fields(&format!("metadata.name={}", deployment.secret_name));
    let crd_names = ctx.crd_names.iter().cloned().collect::<Vec<_>>();
    let event_recorder = Arc::new(Recorder::new(
        client.clone(),
        Reporter {
            controller: FULL_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    Controller::new(
        Api::<CustomResourceDefinition>::all(client),
        watcher::Config::default(),
    )
    .with_config(controller::Config::default().concurrency(concurrency))
    // Any change to the credentials may require every CRD to be updated
    .watches(secrets, secret_selector, move |_secret| {
        crd_names
            .iter()
            .map(|name| ObjectRef::new(name))
            .collect::<Vec<_>>()
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

async fn reconcile(crd: Arc<CustomResourceDefinition>, ctx: Arc<Ctx>) -> Result<Action> {
    let name = crd.name_any();
    if !ctx.crd_names.contains(&name) {
        return Ok(Action::await_change());
    }
    let outcome = match ctx.reconciler.reconcile_crd(&name, OffsetDateTime::now_utc()).await {
        Ok(outcome) => outcome,
        Err(err) => {
            if let Some(restart) = err.restart_requested() {
                request_restart(&ctx, &name, restart);
            }
            return Err(err);
        }
    };
    ctx.backoff.reset(&name);
    if let Outcome::Reconciled {
        restart: Some(restart),
        ..
    } = outcome
    {
        request_restart(&ctx, &name, restart);
    }
    Ok(Action::requeue(ctx.requeue_interval))
}

fn request_restart(ctx: &Ctx, crd_name: &str, restart: RestartRequested) {
    info!(crd.name = crd_name, "credentials were rotated, requesting restart");
    // The receiver only goes away while the process is shutting down anyway
    let _ = ctx.restart.send(restart);
}

fn error_policy(crd: Arc<CustomResourceDefinition>, error: &Error, ctx: Arc<Ctx>) -> Action {
    match error {
        // Needs to be fixed by whoever installed the CRD, retrying won't help
        Error::MissingConversionWebhook { .. } => Action::await_change(),
        Error::RefreshCredentials {
            source: cert_store::Error::LoadCa { .. },
        } => Action::await_change(),
        _ => Action::requeue(ctx.backoff.next_delay(&crd.name_any())),
    }
}
