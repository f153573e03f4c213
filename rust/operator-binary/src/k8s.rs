//! Kubernetes implementations of the APIs used by the controllers

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use serde_json::json;
use snafu::{OptionExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            admissionregistration::v1::ValidatingWebhookConfiguration,
            core::v1::{Endpoints, Secret},
        },
        apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    },
    kube::{
        self,
        api::{Patch, PatchParams, PostParams},
        Api, Resource, ResourceExt,
    },
};

use crate::{
    cert_store::{CredentialRecord, CredentialStore},
    crd_controller::CrdApi,
    webhook_controller::WebhookConfigApi,
};

/// Kubernetes API failures, classified by how callers should react to them.
#[derive(Debug, Snafu)]
pub enum ApiError {
    #[snafu(display("{object} does not exist"))]
    NotFound { object: String },

    #[snafu(display("{object} was modified concurrently"))]
    Conflict { object: String },

    #[snafu(display("request for {object} failed"))]
    Transient { source: kube::Error, object: String },

    #[snafu(display("request for {object} did not complete within {timeout:?}"))]
    Timeout { object: String, timeout: Duration },
}

impl ApiError {
    fn from_kube(err: kube::Error, object: String) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 404 => ApiError::NotFound { object },
            kube::Error::Api(response) if response.code == 409 => ApiError::Conflict { object },
            source => ApiError::Transient { source, object },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

/// Typed access to all objects managed by the controllers.
///
/// Every call is bounded by `timeout`, and nothing is cached.
#[derive(Clone)]
pub struct KubeApis {
    client: kube::Client,
    timeout: Duration,
}

impl KubeApis {
    pub fn new(client: kube::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn call<T>(
        &self,
        object: impl Fn() -> String,
        request: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, ApiError> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(|err| ApiError::from_kube(err, object())),
            Err(_) => TimeoutSnafu {
                object: object(),
                timeout: self.timeout,
            }
            .fail(),
        }
    }
}

/// Whether at least one subset has at least one ready address.
///
/// Addresses that are not ready are listed separately, and do not count.
fn endpoints_ready(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|subset| subset.addresses.as_ref().is_some_and(|addresses| !addresses.is_empty()))
}

/// Merge patch that only applies if the Secret is still at the version `record` was read from.
fn guarded_secret_patch(record: &CredentialRecord) -> Result<serde_json::Value, ApiError> {
    // Without a version the write would silently overwrite whatever is stored
    let resource_version = record
        .resource_version
        .as_ref()
        .with_context(|| ConflictSnafu {
            object: describe::<Secret>(&record.name, Some(&record.namespace)),
        })?;
    Ok(json!({
        "metadata": { "resourceVersion": resource_version },
        "data": record.secret_data(),
    }))
}

fn describe<K: Resource<DynamicType = ()>>(name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{}/{name}.{ns}", K::kind(&())),
        None => format!("{}/{name}", K::kind(&())),
    }
}

#[async_trait]
impl CredentialStore for KubeApis {
    async fn get(&self, name: &str, namespace: &str) -> Result<CredentialRecord, ApiError> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let secret = self
            .call(|| describe::<Secret>(name, Some(namespace)), api.get(name))
            .await?;
        Ok(CredentialRecord::from_secret(&secret))
    }

    async fn put(&self, record: &CredentialRecord) -> Result<CredentialRecord, ApiError> {
        let api = Api::<Secret>::namespaced(self.client.clone(), &record.namespace);
        let patch = guarded_secret_patch(record)?;
        let secret = self
            .call(
                || describe::<Secret>(&record.name, Some(&record.namespace)),
                api.patch(&record.name, &PatchParams::default(), &Patch::Merge(&patch)),
            )
            .await?;
        Ok(CredentialRecord::from_secret(&secret))
    }
}

#[async_trait]
impl CrdApi for KubeApis {
    async fn get_crd(&self, name: &str) -> Result<CustomResourceDefinition, ApiError> {
        let api = Api::<CustomResourceDefinition>::all(self.client.clone());
        self.call(|| describe::<CustomResourceDefinition>(name, None), api.get(name))
            .await
    }

    async fn replace_crd(&self, crd: &CustomResourceDefinition) -> Result<(), ApiError> {
        let api = Api::<CustomResourceDefinition>::all(self.client.clone());
        let name = crd.name_any();
        self.call(
            || describe::<CustomResourceDefinition>(&name, None),
            api.replace(&name, &PostParams::default(), crd),
        )
        .await
        .map(drop)
    }
}

#[async_trait]
impl WebhookConfigApi for KubeApis {
    async fn get_webhook_config(
        &self,
        name: &str,
    ) -> Result<ValidatingWebhookConfiguration, ApiError> {
        let api = Api::<ValidatingWebhookConfiguration>::all(self.client.clone());
        self.call(
            || describe::<ValidatingWebhookConfiguration>(name, None),
            api.get(name),
        )
        .await
    }

    async fn replace_webhook_config(
        &self,
        config: &ValidatingWebhookConfiguration,
    ) -> Result<(), ApiError> {
        let api = Api::<ValidatingWebhookConfiguration>::all(self.client.clone());
        let name = config.name_any();
        self.call(
            || describe::<ValidatingWebhookConfiguration>(&name, None),
            api.replace(&name, &PostParams::default(), config),
        )
        .await
        .map(drop)
    }

    async fn has_ready_endpoints(
        &self,
        service_name: &str,
        service_namespace: &str,
    ) -> Result<bool, ApiError> {
        let api = Api::<Endpoints>::namespaced(self.client.clone(), service_namespace);
        let endpoints = self
            .call(
                || describe::<Endpoints>(service_name, Some(service_namespace)),
                api.get_opt(service_name),
            )
            .await?;
        Ok(endpoints.as_ref().is_some_and(endpoints_ready))
    }
}
