use stackable_operator::{k8s_openapi::api::core::v1::Secret, kube::runtime::reflector::ObjectRef};

pub mod backoff;
pub mod cert_store;
pub mod crd_controller;
pub mod k8s;
pub mod leader_election;
pub mod pki;
pub mod readiness;
pub mod utils;
pub mod webhook_controller;

#[cfg(test)]
mod testing;

pub const OPERATOR_NAME: &str = "cert-controller.secret-sync.io";

/// Where the webhook is served from, and where its credentials are kept.
#[derive(Clone, Debug)]
pub struct WebhookDeployment {
    pub service_name: String,
    pub service_namespace: String,
    pub secret_name: String,
    pub secret_namespace: String,
}

impl WebhookDeployment {
    pub fn secret_ref(&self) -> ObjectRef<Secret> {
        ObjectRef::new(&self.secret_name).within(&self.secret_namespace)
    }
}
