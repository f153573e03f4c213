//! Persistence of the webhook credentials, and the rotation that keeps them fresh

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::{ensure, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{runtime::reflector::ObjectRef, ResourceExt},
};
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::{
    k8s::ApiError,
    pki::{self, CertificateAuthority, CertificateIdentity, RefreshNeeded},
};

pub const SECRET_KEY_CA_CERT: &str = "ca.crt";
pub const SECRET_KEY_CA_KEY: &str = "ca.key";
pub const SECRET_KEY_TLS_CERT: &str = "tls.crt";
pub const SECRET_KEY_TLS_KEY: &str = "tls.key";

/// The CA and serving certificate of the webhook, as stored in a [`Secret`].
///
/// Missing entries are [`None`], which [`pki::needs_refresh`] treats as stale.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialRecord {
    pub name: String,
    pub namespace: String,
    /// Version of the backing object this record was read from, [`None`] if it was never persisted
    ///
    /// Unversioned records cannot be written, see [`CredentialStore::put`].
    pub resource_version: Option<String>,
    pub ca_cert: Option<Vec<u8>>,
    pub ca_key: Option<Vec<u8>>,
    pub tls_cert: Option<Vec<u8>>,
    pub tls_key: Option<Vec<u8>>,
}

impl CredentialRecord {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn object_ref(&self) -> ObjectRef<Secret> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }

    pub fn from_secret(secret: &Secret) -> Self {
        let data = secret.data.as_ref();
        let blob = |key: &str| {
            data.and_then(|data| data.get(key))
                .map(|value| value.0.clone())
                .filter(|value| !value.is_empty())
        };
        Self {
            name: secret.name_any(),
            namespace: secret.namespace().unwrap_or_default(),
            resource_version: secret.resource_version(),
            ca_cert: blob(SECRET_KEY_CA_CERT),
            ca_key: blob(SECRET_KEY_CA_KEY),
            tls_cert: blob(SECRET_KEY_TLS_CERT),
            tls_key: blob(SECRET_KEY_TLS_KEY),
        }
    }

    /// The `data` entries owned by this record, other keys of the [`Secret`] are left alone.
    pub fn secret_data(&self) -> BTreeMap<String, ByteString> {
        [
            (SECRET_KEY_CA_CERT, &self.ca_cert),
            (SECRET_KEY_CA_KEY, &self.ca_key),
            (SECRET_KEY_TLS_CERT, &self.tls_cert),
            (SECRET_KEY_TLS_KEY, &self.tls_key),
        ]
        .into_iter()
        .filter_map(|(key, value)| Some((key.to_string(), ByteString(value.clone()?))))
        .collect()
    }
}

/// Durable storage for the [`CredentialRecord`].
///
/// Implementations must not cache, every [`CredentialStore::get`] reads the current state.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, name: &str, namespace: &str) -> Result<CredentialRecord, ApiError>;

    /// Writes `record` if it is still based on the latest version, returning the stored record.
    ///
    /// Fails with [`ApiError::Conflict`] if the record was modified since it was read, or was
    /// never read from the store at all.
    async fn put(&self, record: &CredentialRecord) -> Result<CredentialRecord, ApiError>;
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate new CA"))]
    GenerateCa { source: pki::Error },

    #[snafu(display("failed to load stored CA"))]
    LoadCa { source: pki::FormatError },

    #[snafu(display("failed to generate new serving certificate"))]
    GenerateLeaf { source: pki::Error },

    #[snafu(display("failed to save rotated credentials to {secret}"))]
    SaveCredentials {
        source: ApiError,
        secret: ObjectRef<Secret>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// How generated credentials are named, and when they are replaced.
#[derive(Clone, Debug)]
pub struct RotationPolicy {
    pub identity: CertificateIdentity,
    /// Credentials are replaced once they would be invalid this far in the future
    pub lookahead: Duration,
    /// Validity of newly generated certificates
    pub cert_lifetime: Duration,
}

#[derive(Debug, Snafu)]
pub enum PolicyError {
    #[snafu(display(
        "certificate lifetime ({cert_lifetime}) must be longer than the lookahead interval ({lookahead})"
    ))]
    LifetimeWithinLookahead {
        cert_lifetime: Duration,
        lookahead: Duration,
    },
}

impl RotationPolicy {
    /// Newly issued certificates must not already be due for rotation.
    pub fn check(&self) -> Result<(), PolicyError> {
        ensure!(
            self.cert_lifetime > self.lookahead,
            LifetimeWithinLookaheadSnafu {
                cert_lifetime: self.cert_lifetime,
                lookahead: self.lookahead,
            }
        );
        Ok(())
    }
}

/// Certificates are backdated to tolerate clock skew between the operator and its peers.
const CLOCK_SKEW_ALLOWANCE: Duration = Duration::hours(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refreshed {
    Unchanged,
    Leaf,
    CaAndLeaf,
}

impl Refreshed {
    pub fn rotated(self) -> bool {
        self != Refreshed::Unchanged
    }
}

/// Emitted after rotated credentials were persisted, when the process should restart to pick
/// them up rather than continuing with the material it has loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartRequested;

/// Regenerates whatever part of `record` is (about to become) invalid, and persists the result.
///
/// On success `record` reflects the stored state.
pub async fn refresh_credentials(
    store: &dyn CredentialStore,
    record: &mut CredentialRecord,
    policy: &RotationPolicy,
    now: OffsetDateTime,
) -> Result<Refreshed> {
    let refresh = pki::needs_refresh(record, &policy.identity, now + policy.lookahead);
    let refreshed = match refresh {
        RefreshNeeded { ca: true, .. } => Refreshed::CaAndLeaf,
        RefreshNeeded { leaf: true, .. } => Refreshed::Leaf,
        _ => return Ok(Refreshed::Unchanged),
    };
    let begin = now - CLOCK_SKEW_ALLOWANCE;
    let end = now + policy.cert_lifetime;
    let ca = match refreshed {
        Refreshed::CaAndLeaf => {
            info!(secret = %record.object_ref(), "generating new CA");
            let ca = pki::create_ca_cert(&policy.identity, begin, end).context(GenerateCaSnafu)?;
            record.ca_cert = Some(ca.cert_pem.clone());
            record.ca_key = Some(ca.key_pem.clone());
            ca
        }
        _ => CertificateAuthority::from_pem(
            record.ca_cert.as_deref().unwrap_or_default(),
            record.ca_key.as_deref().unwrap_or_default(),
        )
        .context(LoadCaSnafu)?,
    };
    let leaf =
        pki::create_leaf_cert(&ca, &policy.identity, begin, end).context(GenerateLeafSnafu)?;
    record.tls_cert = Some(leaf.cert_pem);
    record.tls_key = Some(leaf.key_pem);
    *record = store
        .put(record)
        .await
        .with_context(|_| SaveCredentialsSnafu {
            secret: record.object_ref(),
        })?;
    match ca.not_after() {
        Ok(ca_expires_at) => info!(
            secret = %record.object_ref(),
            ?refreshed,
            %ca_expires_at,
            "saved rotated credentials"
        ),
        Err(_) => info!(secret = %record.object_ref(), ?refreshed, "saved rotated credentials"),
    }
    Ok(refreshed)
}
