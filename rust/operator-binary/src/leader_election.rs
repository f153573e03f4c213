//! Leader election using a coordination.k8s.io/v1 [`Lease`]
//!
//! Every write is guarded by the resourceVersion that was read, so two instances can never both
//! believe that they acquired the same lease. A conflict just means that someone else won.

use std::time::Duration;

use serde_json::json;
use snafu::{ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::api::coordination::v1::Lease,
    kube::{
        self,
        api::{Patch, PatchParams, PostParams},
        runtime::reflector::ObjectRef,
        Api,
    },
};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info, warn};

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// The `MicroTime` wire format, always in UTC
const MICRO_TIME: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {lease}"))]
    GetLease {
        source: kube::Error,
        lease: ObjectRef<Lease>,
    },

    #[snafu(display("failed to write {lease}"))]
    WriteLease {
        source: kube::Error,
        lease: ObjectRef<Lease>,
    },

    #[snafu(display("failed to build {lease}"))]
    BuildLease {
        source: serde_json::Error,
        lease: ObjectRef<Lease>,
    },

    #[snafu(display("failed to format lease timestamp"))]
    FormatTime { source: time::error::Format },

    #[snafu(display("lost {lease} to another instance"))]
    LeaseLost { lease: ObjectRef<Lease> },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The parts of a [`Lease`] that decide who may hold it.
#[derive(Debug, Default, PartialEq, Eq)]
struct LeaseState {
    holder: Option<String>,
    renewed_at: Option<OffsetDateTime>,
    duration: Option<Duration>,
    transitions: i32,
    resource_version: Option<String>,
}

impl LeaseState {
    fn from_lease(lease: &Lease) -> Self {
        let spec = lease.spec.clone().unwrap_or_default();
        // The typed MicroTime wraps a different time crate depending on the k8s-openapi version
        let renewed_at = serde_json::to_value(&lease.spec)
            .ok()
            .and_then(|spec| spec.get("renewTime")?.as_str().map(str::to_string))
            .and_then(|renew_time| parse_micro_time(&renew_time));
        Self {
            holder: spec.holder_identity.filter(|holder| !holder.is_empty()),
            renewed_at,
            duration: spec
                .lease_duration_seconds
                .and_then(|secs| u64::try_from(secs).ok())
                .map(Duration::from_secs),
            transitions: spec.lease_transitions.unwrap_or(0),
            resource_version: lease.metadata.resource_version.clone(),
        }
    }

    fn is_expired(&self, now: OffsetDateTime) -> bool {
        match (self.renewed_at, self.duration) {
            (Some(renewed_at), Some(duration)) => now > renewed_at + duration,
            _ => true,
        }
    }
}

fn parse_micro_time(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339).ok()
}

fn format_micro_time(time: OffsetDateTime) -> Result<String> {
    time.to_offset(time::UtcOffset::UTC)
        .format(MICRO_TIME)
        .context(FormatTimeSnafu)
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Create,
    Renew,
    TakeOver,
    Wait,
}

fn next_step(existing: Option<&LeaseState>, identity: &str, now: OffsetDateTime) -> Step {
    match existing {
        None => Step::Create,
        Some(state) if state.holder.as_deref() == Some(identity) => Step::Renew,
        Some(state) if state.holder.is_none() || state.is_expired(now) => Step::TakeOver,
        Some(_) => Step::Wait,
    }
}

pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: kube::Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
        }
    }

    fn lease_ref(&self) -> ObjectRef<Lease> {
        ObjectRef::new(&self.lease_name).within(&self.namespace)
    }

    /// Waits for the lease, fires every `elected` signal, and then keeps renewing it.
    ///
    /// Only returns once the lease was lost.
    pub async fn run(&self, elected: Vec<oneshot::Sender<()>>) -> Result<()> {
        self.acquire().await;
        for signal in elected {
            // Dropped receivers belong to checks that no longer care
            let _ = signal.send(());
        }
        self.hold().await
    }

    pub async fn acquire(&self) {
        info!(identity = %self.identity, lease = %self.lease_ref(), "waiting for leadership");
        loop {
            match self.try_acquire_or_renew(OffsetDateTime::now_utc()).await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return;
                }
                Ok(false) => debug!(identity = %self.identity, "lease is held by another instance"),
                Err(err) => warn!(
                    identity = %self.identity,
                    error = &err as &dyn std::error::Error,
                    "failed to acquire lease, retrying"
                ),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renews the lease until it is lost, either to another instance or by failing to renew
    /// it before it expired.
    pub async fn hold(&self) -> Result<()> {
        let mut renewed_at = Instant::now();
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew(OffsetDateTime::now_utc()).await {
                Ok(true) => renewed_at = Instant::now(),
                Ok(false) => {
                    return LeaseLostSnafu {
                        lease: self.lease_ref(),
                    }
                    .fail()
                }
                Err(err) if renewed_at.elapsed() < LEASE_DURATION => warn!(
                    identity = %self.identity,
                    error = &err as &dyn std::error::Error,
                    "failed to renew lease, retrying"
                ),
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_acquire_or_renew(&self, now: OffsetDateTime) -> Result<bool> {
        let lease_ref = self.lease_ref();
        let existing = self
            .leases
            .get_opt(&self.lease_name)
            .await
            .with_context(|_| GetLeaseSnafu {
                lease: lease_ref.clone(),
            })?
            .as_ref()
            .map(LeaseState::from_lease);
        let now_str = format_micro_time(now)?;
        let lease_duration_seconds = LEASE_DURATION.as_secs();
        let write = match next_step(existing.as_ref(), &self.identity, now) {
            Step::Wait => return Ok(false),
            Step::Create => {
                let lease: Lease = serde_json::from_value(json!({
                    "metadata": {
                        "name": self.lease_name,
                    },
                    "spec": {
                        "holderIdentity": self.identity,
                        "leaseDurationSeconds": lease_duration_seconds,
                        "acquireTime": now_str,
                        "renewTime": now_str,
                        "leaseTransitions": 0,
                    },
                }))
                .with_context(|_| BuildLeaseSnafu {
                    lease: lease_ref.clone(),
                })?;
                self.leases
                    .create(&PostParams::default(), &lease)
                    .await
                    .map(drop)
            }
            Step::Renew => {
                let resource_version = existing
                    .as_ref()
                    .and_then(|state| state.resource_version.clone());
                let patch = json!({
                    "metadata": { "resourceVersion": resource_version },
                    "spec": { "renewTime": now_str },
                });
                self.leases
                    .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(drop)
            }
            Step::TakeOver => {
                let state = existing.unwrap_or_default();
                let patch = json!({
                    "metadata": { "resourceVersion": state.resource_version },
                    "spec": {
                        "holderIdentity": self.identity,
                        "leaseDurationSeconds": lease_duration_seconds,
                        "acquireTime": now_str,
                        "renewTime": now_str,
                        "leaseTransitions": state.transitions + 1,
                    },
                });
                info!(
                    identity = %self.identity,
                    previous_holder = ?state.holder,
                    "taking over expired lease"
                );
                self.leases
                    .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(drop)
            }
        };
        match write {
            Ok(()) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(identity = %self.identity, "lease was modified concurrently");
                Ok(false)
            }
            Err(source) => Err(Error::WriteLease {
                source,
                lease: lease_ref,
            }),
        }
    }
}
