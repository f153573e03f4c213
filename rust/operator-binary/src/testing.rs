//! In-memory fakes of the Kubernetes seams, and fixtures shared by the controller tests

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::{
        api::admissionregistration::v1::ValidatingWebhookConfiguration,
        apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    },
    kube::ResourceExt,
};
use time::{Duration, OffsetDateTime};

use crate::{
    cert_store::{CredentialRecord, CredentialStore, RotationPolicy},
    crd_controller::CrdApi,
    k8s::ApiError,
    pki::{self, CertificateIdentity},
    webhook_controller::WebhookConfigApi,
    WebhookDeployment,
};

pub fn deployment() -> WebhookDeployment {
    WebhookDeployment {
        service_name: "secret-sync-webhook".to_string(),
        service_namespace: "secret-sync".to_string(),
        secret_name: "webhook".to_string(),
        secret_namespace: "ns".to_string(),
    }
}

pub fn policy() -> RotationPolicy {
    RotationPolicy {
        identity: CertificateIdentity {
            ca_name: "secret-sync".to_string(),
            organization: "secret-sync".to_string(),
            service_dns_name: pki::service_dns_name("secret-sync-webhook", "secret-sync"),
        },
        lookahead: Duration::days(90),
        cert_lifetime: Duration::days(3650),
    }
}

fn record_valid_between(begin: OffsetDateTime, end: OffsetDateTime) -> CredentialRecord {
    let identity = policy().identity;
    let ca = pki::create_ca_cert(&identity, begin, end).unwrap();
    let leaf = pki::create_leaf_cert(&ca, &identity, begin, end).unwrap();
    CredentialRecord {
        ca_cert: Some(ca.cert_pem),
        ca_key: Some(ca.key_pem),
        tls_cert: Some(leaf.cert_pem),
        tls_key: Some(leaf.key_pem),
        ..CredentialRecord::new("webhook", "ns")
    }
}

/// Credentials that were issued an hour ago, and stay valid for `lifetime`.
pub fn fresh_record(lifetime: Duration) -> CredentialRecord {
    let now = OffsetDateTime::now_utc();
    record_valid_between(now - Duration::hours(1), now + lifetime)
}

pub fn expired_record() -> CredentialRecord {
    let now = OffsetDateTime::now_utc();
    record_valid_between(now - Duration::days(400), now - Duration::days(1))
}

/// A [`CredentialStore`] holding at most one record, versioned by a counter.
#[derive(Default)]
pub struct InMemoryStore {
    record: Mutex<Option<CredentialRecord>>,
    puts: AtomicUsize,
    conflict_on_next_put: AtomicBool,
}

impl InMemoryStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_record(record: CredentialRecord) -> Self {
        let store = Self::default();
        *store.record.lock().unwrap() = Some(CredentialRecord {
            resource_version: Some("1".to_string()),
            ..record
        });
        store
    }

    /// Number of successful writes
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Simulates another writer winning the race for the next write
    pub fn conflict_on_next_put(&self) {
        self.conflict_on_next_put.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<CredentialRecord, ApiError> {
        self.record
            .lock()
            .unwrap()
            .clone()
            .filter(|record| record.name == name && record.namespace == namespace)
            .ok_or_else(|| ApiError::NotFound {
                object: format!("Secret/{name}.{namespace}"),
            })
    }

    async fn put(&self, record: &CredentialRecord) -> Result<CredentialRecord, ApiError> {
        let object = format!("Secret/{}.{}", record.name, record.namespace);
        if self.conflict_on_next_put.swap(false, Ordering::SeqCst) {
            return Err(ApiError::Conflict { object });
        }
        let mut stored = self.record.lock().unwrap();
        let current_version = stored
            .as_ref()
            .and_then(|stored| stored.resource_version.clone());
        if record.resource_version.is_none() || record.resource_version != current_version {
            return Err(ApiError::Conflict { object });
        }
        let next_version = current_version
            .and_then(|version| version.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let new = CredentialRecord {
            resource_version: Some(next_version.to_string()),
            ..record.clone()
        };
        *stored = Some(new.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(new)
    }
}

#[derive(Default)]
pub struct FakeCrdApi {
    crds: Mutex<BTreeMap<String, CustomResourceDefinition>>,
    writes: AtomicUsize,
    conflict_on_next_replace: AtomicBool,
}

impl FakeCrdApi {
    pub fn with_crd(crd: CustomResourceDefinition) -> Self {
        let api = Self::default();
        api.crds.lock().unwrap().insert(crd.name_any(), crd);
        api
    }

    pub fn crd(&self, name: &str) -> Option<CustomResourceDefinition> {
        self.crds.lock().unwrap().get(name).cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulates someone else modifying the CRD before our next write
    pub fn conflict_on_next_replace(&self) {
        self.conflict_on_next_replace.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CrdApi for FakeCrdApi {
    async fn get_crd(&self, name: &str) -> Result<CustomResourceDefinition, ApiError> {
        self.crd(name).ok_or_else(|| ApiError::NotFound {
            object: format!("CustomResourceDefinition/{name}"),
        })
    }

    async fn replace_crd(&self, crd: &CustomResourceDefinition) -> Result<(), ApiError> {
        if self.conflict_on_next_replace.swap(false, Ordering::SeqCst) {
            return Err(ApiError::Conflict {
                object: format!("CustomResourceDefinition/{}", crd.name_any()),
            });
        }
        self.crds.lock().unwrap().insert(crd.name_any(), crd.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeWebhookApi {
    config: Mutex<Option<ValidatingWebhookConfiguration>>,
    writes: AtomicUsize,
    ready_endpoints: AtomicBool,
}

impl FakeWebhookApi {
    pub fn with_config(config: ValidatingWebhookConfiguration) -> Self {
        let api = Self::default();
        *api.config.lock().unwrap() = Some(config);
        api
    }

    pub fn config(&self) -> Option<ValidatingWebhookConfiguration> {
        self.config.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_ready_endpoints(&self, ready: bool) {
        self.ready_endpoints.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl WebhookConfigApi for FakeWebhookApi {
    async fn get_webhook_config(
        &self,
        name: &str,
    ) -> Result<ValidatingWebhookConfiguration, ApiError> {
        self.config()
            .filter(|config| config.name_any() == name)
            .ok_or_else(|| ApiError::NotFound {
                object: format!("ValidatingWebhookConfiguration/{name}"),
            })
    }

    async fn replace_webhook_config(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<(), ApiError> {
        *self.config.lock().unwrap() = Some(config.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn has_ready_endpoints(
        &self,
        _service_name: &str,
        _service_namespace: &str,
    ) -> Result<bool, ApiError> {
        Ok(self.ready_endpoints.load(Ordering::SeqCst))
    }
}
