//! Readiness reporting for the controllers, and the HTTP server that exposes it to the kubelet

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Router,
};
use snafu::{ResultExt, Snafu};
use tokio::{net::TcpListener, sync::oneshot};

use crate::{k8s::ApiError, utils::error_full_message};

/// Set once a controller has successfully reconciled, never reset afterwards.
#[derive(Debug, Default)]
pub struct ReadinessState(AtomicBool);

impl ReadinessState {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tracks whether this instance has become the leader.
///
/// The leader signal is polled without blocking, and remembered once it has fired.
#[derive(Debug)]
pub struct LeaderGate {
    signal: Mutex<Option<oneshot::Receiver<()>>>,
    elected: AtomicBool,
}

impl LeaderGate {
    pub fn new(signal: oneshot::Receiver<()>) -> Self {
        Self {
            signal: Mutex::new(Some(signal)),
            elected: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        if self.elected.load(Ordering::Acquire) {
            return true;
        }
        let mut signal = self
            .signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(receiver) = signal.as_mut() else {
            return false;
        };
        match receiver.try_recv() {
            Ok(()) => {
                self.elected.store(true, Ordering::Release);
                *signal = None;
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            // The elector is gone without ever electing us
            Err(oneshot::error::TryRecvError::Closed) => {
                *signal = None;
                false
            }
        }
    }
}

#[derive(Debug, Snafu)]
pub enum NotReady {
    #[snafu(display("controller has not completed a reconciliation yet"))]
    NotReconciled,

    #[snafu(display("no ready endpoints for Service {service}"))]
    NoReadyEndpoints { service: String },

    #[snafu(display("failed to look up endpoints for Service {service}"))]
    EndpointLookup { source: ApiError, service: String },
}

#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self) -> Result<(), NotReady>;
}

#[derive(Debug, Snafu)]
pub enum ServeError {
    #[snafu(display("failed to bind probe server to {addr}"))]
    Bind {
        source: std::io::Error,
        addr: SocketAddr,
    },

    #[snafu(display("probe server failed"))]
    Serve { source: std::io::Error },
}

type NamedChecks = Arc<Vec<(&'static str, Arc<dyn ReadinessCheck>)>>;

/// Serves `/healthz` (always healthy) and `/readyz` (healthy when all `checks` pass).
///
/// Individual checks are available under `/readyz/<name>`.
pub async fn serve(
    addr: SocketAddr,
    checks: Vec<(&'static str, Arc<dyn ReadinessCheck>)>,
) -> Result<(), ServeError> {
    let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
    tracing::info!(%addr, "serving health probes");
    axum::serve(listener, router(Arc::new(checks)))
        .await
        .context(ServeSnafu)
}

fn router(checks: NamedChecks) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/readyz/:check", get(readyz_single))
        .with_state(checks)
}

async fn readyz(State(checks): State<NamedChecks>) -> (StatusCode, String) {
    let mut failures = Vec::new();
    for (name, check) in checks.iter() {
        if let Err(err) = check.check().await {
            failures.push(format!("[-]{name} failed: {}", error_full_message(&err)));
        }
    }
    if failures.is_empty() {
        (StatusCode::OK, "ok".to_string())
    } else {
        tracing::debug!(?failures, "readiness check failed");
        (StatusCode::INTERNAL_SERVER_ERROR, failures.join("\n"))
    }
}

async fn readyz_single(
    State(checks): State<NamedChecks>,
    Path(name): Path<String>,
) -> (StatusCode, String) {
    let Some((_, check)) = checks.iter().find(|(check_name, _)| *check_name == name) else {
        return (StatusCode::NOT_FOUND, format!("no such check: {name}"));
    };
    match check.check().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("[-]{name} failed: {}", error_full_message(&err)),
        ),
    }
}
