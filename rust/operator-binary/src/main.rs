use std::{net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use clap::{crate_description, crate_version, Parser};
use secret_sync_cert_controller::{
    backoff::Backoff,
    cert_store::{RestartRequested, RotationPolicy},
    crd_controller::{self, CrdReadiness, CrdReconciler},
    k8s::KubeApis,
    leader_election::LeaderElector,
    pki::{self, CertificateIdentity},
    readiness::{self, LeaderGate, ReadinessCheck, ReadinessState},
    webhook_controller::{self, WebhookReadiness, WebhookReconciler},
    WebhookDeployment,
};
use stackable_operator::{kube, time::Duration};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::{mpsc, oneshot},
};
use tracing::{info, level_filters::LevelFilter};

const LOG_ENV_VAR: &str = "SECRET_SYNC_CERT_CONTROLLER_LOG";
const CA_NAME: &str = "secret-sync";
const CA_ORGANIZATION: &str = "secret-sync";

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(clap::Parser)]
#[clap(author, version, about)]
struct Opts {
    /// Service that serves the conversion and admission webhooks
    #[arg(long, env, default_value = "secret-sync-webhook")]
    service_name: String,
    #[arg(long, env, default_value = "default")]
    service_namespace: String,

    /// Secret that the webhook CA and serving certificate are stored in
    #[arg(long, env, default_value = "secret-sync-webhook")]
    secret_name: String,
    #[arg(long, env, default_value = "default")]
    secret_namespace: String,

    /// CustomResourceDefinitions whose conversion webhook should be kept up to date
    #[arg(
        long,
        env,
        value_delimiter = ',',
        default_value = "externalsecrets.secret-sync.io,secretstores.secret-sync.io,clustersecretstores.secret-sync.io"
    )]
    crd_names: Vec<String>,

    /// ValidatingWebhookConfiguration that should be kept up to date
    #[arg(long, env, default_value = "secret-sync-validate")]
    webhook_config_name: String,

    #[arg(long, env, default_value = "5m")]
    crd_requeue_interval: Duration,
    #[arg(long, env, default_value = "5m")]
    webhook_requeue_interval: Duration,

    /// Certificates are rotated once they would expire within this interval
    #[arg(long, env, default_value = "90d")]
    lookahead_interval: Duration,
    /// Validity of newly issued certificates
    #[arg(long, env, default_value = "3650d")]
    cert_lifetime: Duration,

    /// Exit after rotating the certificates, so that they are picked up by the restarted process
    #[arg(long, env)]
    restart_on_secret_refresh: bool,

    /// Number of objects that each controller reconciles in parallel
    #[arg(long, env, default_value_t = 1)]
    concurrent: u16,

    /// Deadline for each individual Kubernetes API request
    #[arg(long, env, default_value = "30s")]
    api_timeout: Duration,

    #[arg(long, env, default_value = "0.0.0.0:8081")]
    healthz_addr: SocketAddr,

    #[arg(long, env)]
    enable_leader_election: bool,
    #[arg(long, env, default_value = "secret-sync-cert-controller")]
    leader_election_id: String,
    /// Defaults to the namespace of the Secret
    #[arg(long, env)]
    leader_election_namespace: Option<String>,
    /// Identity of this instance, required for leader election
    #[arg(long, env)]
    pod_name: Option<String>,

    #[arg(long, env, value_enum, default_value_t)]
    log_format: LogFormat,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn initialize_logging(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV_VAR)
        .from_env()
        .context("failed to parse log filter")?;
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Plain => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
    Ok(())
}

fn to_time_duration(duration: Duration, flag: &str) -> anyhow::Result<time::Duration> {
    time::Duration::try_from(*duration).with_context(|| format!("--{flag} is out of range"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    initialize_logging(opts.log_format)?;
    stackable_operator::utils::print_startup_string(
        crate_description!(),
        crate_version!(),
        built_info::GIT_VERSION,
        built_info::TARGET,
        built_info::BUILT_TIME_UTC,
        built_info::RUSTC_VERSION,
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let apis = Arc::new(KubeApis::new(client.clone(), *opts.api_timeout));
    let deployment = WebhookDeployment {
        service_name: opts.service_name.clone(),
        service_namespace: opts.service_namespace.clone(),
        secret_name: opts.secret_name.clone(),
        secret_namespace: opts.secret_namespace.clone(),
    };
    let rotation = RotationPolicy {
        identity: CertificateIdentity {
            ca_name: CA_NAME.to_string(),
            organization: CA_ORGANIZATION.to_string(),
            service_dns_name: pki::service_dns_name(&opts.service_name, &opts.service_namespace),
        },
        lookahead: to_time_duration(opts.lookahead_interval, "lookahead-interval")?,
        cert_lifetime: to_time_duration(opts.cert_lifetime, "cert-lifetime")?,
    };
    rotation
        .check()
        .context("invalid certificate rotation settings")?;

    let (crd_elected, crd_leader) = oneshot::channel();
    let (webhook_elected, webhook_leader) = oneshot::channel();
    let (controllers_elected, controllers_leader) = oneshot::channel();
    let crd_readiness = Arc::new(ReadinessState::default());
    let webhook_readiness = Arc::new(ReadinessState::default());
    let crd_check: Arc<dyn ReadinessCheck> = Arc::new(CrdReadiness {
        leader: Arc::new(LeaderGate::new(crd_leader)),
        state: crd_readiness.clone(),
    });
    let webhook_check: Arc<dyn ReadinessCheck> = Arc::new(WebhookReadiness {
        leader: Arc::new(LeaderGate::new(webhook_leader)),
        state: webhook_readiness.clone(),
        api: apis.clone(),
        service_name: opts.service_name.clone(),
        service_namespace: opts.service_namespace.clone(),
    });
    let checks = vec![("crd-inject", crd_check), ("webhook-inject", webhook_check)];

    let (restart_tx, mut restart_rx) = mpsc::unbounded_channel::<RestartRequested>();
    let crd_ctx = crd_controller::Ctx {
        reconciler: CrdReconciler {
            store: apis.clone(),
            api: apis.clone(),
            deployment: deployment.clone(),
            rotation,
            restart_on_refresh: opts.restart_on_secret_refresh,
            readiness: crd_readiness,
        },
        crd_names: opts.crd_names.iter().cloned().collect(),
        requeue_interval: *opts.crd_requeue_interval,
        restart: restart_tx,
        backoff: Backoff::default(),
    };
    let webhook_ctx = webhook_controller::Ctx {
        reconciler: WebhookReconciler {
            store: apis.clone(),
            api: apis,
            deployment,
            config_name: opts.webhook_config_name.clone(),
            readiness: webhook_readiness,
        },
        requeue_interval: *opts.webhook_requeue_interval,
        backoff: Backoff::default(),
    };

    let elected = vec![crd_elected, webhook_elected, controllers_elected];
    let elector = if opts.enable_leader_election {
        let identity = opts
            .pod_name
            .as_deref()
            .context("--pod-name is required when leader election is enabled")?;
        let namespace = opts
            .leader_election_namespace
            .as_deref()
            .unwrap_or(&opts.secret_namespace);
        Some(LeaderElector::new(
            client.clone(),
            namespace,
            &opts.leader_election_id,
            identity,
        ))
    } else {
        None
    };
    let leadership = async {
        match &elector {
            Some(elector) => elector.run(elected).await,
            None => {
                for signal in elected {
                    let _ = signal.send(());
                }
                std::future::pending().await
            }
        }
    };
    let controllers = async {
        if controllers_leader.await.is_err() {
            return std::future::pending().await;
        }
        info!("starting controllers");
        futures::join!(
            crd_controller::start(client.clone(), crd_ctx, opts.concurrent),
            webhook_controller::start(client.clone(), webhook_ctx, opts.concurrent),
        );
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = readiness::serve(opts.healthz_addr, checks) => {
            res.context("health probe server failed")?;
            anyhow::bail!("health probe server stopped unexpectedly");
        }
        res = leadership => {
            res.context("leader election failed")?;
        }
        () = controllers => {
            anyhow::bail!("controllers stopped unexpectedly");
        }
        Some(RestartRequested) = restart_rx.recv() => {
            info!("credentials were rotated, exiting to let the supervisor restart us");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
        Ok(()) = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, shutting down");
        }
    }
    Ok(())
}
