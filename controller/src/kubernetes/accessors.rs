//! Read paths into the object caches and the API server, behind traits so
//! the reconciler can be driven by fixtures in tests.

use crate::kubernetes::ObjectKey;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend, ServiceBackendPort};
use kube::api::Api;
use kube::runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;
use thiserror::Error;

pub trait IngressAccessor: Send + Sync {
    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<Ingress>>;
    fn list(&self) -> Vec<Arc<Ingress>>;
}

pub trait ConfigMapAccessor: Send + Sync {
    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<ConfigMap>>;
}

/// Secrets are fetched through the API server on demand instead of being
/// cached; the reconciler never holds its lock across this call path's
/// network round trip.
#[async_trait]
pub trait SecretAccessor: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error>;
}

#[derive(Debug, Error)]
pub enum EndpointsLookupError {
    #[error("service {0} does not exist")]
    ServiceNotFound(ObjectKey),
    #[error("service {service} has no port matching {port:?}")]
    PortNotFound { service: ObjectKey, port: String },
    #[error("no endpoints for service {service} port {port:?}")]
    EndpointsNotFound { service: ObjectKey, port: String },
}

pub trait EndpointsAccessor: Send + Sync {
    /// Resolves an ingress backend to its `address:port` endpoints.
    fn endpoints_for_backend(
        &self,
        namespace: &str,
        backend: &IngressServiceBackend,
    ) -> Result<Vec<String>, EndpointsLookupError>;
}

pub struct CachedIngresses {
    store: Store<Ingress>,
}

impl CachedIngresses {
    pub fn new(store: Store<Ingress>) -> Self {
        Self { store }
    }
}

impl IngressAccessor for CachedIngresses {
    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<Ingress>> {
        self.store
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    fn list(&self) -> Vec<Arc<Ingress>> {
        self.store.state()
    }
}

pub struct CachedConfigMaps {
    store: Option<Store<ConfigMap>>,
}

impl CachedConfigMaps {
    pub fn new(store: Option<Store<ConfigMap>>) -> Self {
        Self { store }
    }
}

impl ConfigMapAccessor for CachedConfigMaps {
    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<ConfigMap>> {
        self.store
            .as_ref()?
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }
}

pub struct ApiSecrets {
    client: kube::Client,
}

impl ApiSecrets {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretAccessor for ApiSecrets {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(err) => Err(err),
        }
    }
}

pub struct CachedEndpoints {
    services: Store<Service>,
    endpoints: Store<Endpoints>,
}

impl CachedEndpoints {
    pub fn new(services: Store<Service>, endpoints: Store<Endpoints>) -> Self {
        Self {
            services,
            endpoints,
        }
    }
}

impl EndpointsAccessor for CachedEndpoints {
    fn endpoints_for_backend(
        &self,
        namespace: &str,
        backend: &IngressServiceBackend,
    ) -> Result<Vec<String>, EndpointsLookupError> {
        let service_key = ObjectKey::new(namespace, &backend.name);
        let port_label = port_label(backend.port.as_ref());

        let service = self
            .services
            .get(&ObjectRef::new(&service_key.name).within(&service_key.namespace))
            .ok_or_else(|| EndpointsLookupError::ServiceNotFound(service_key.clone()))?;

        // Match the backend's port reference against the service ports; the
        // matched port's name keys into the endpoint subsets below.
        let service_port = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .into_iter()
            .flatten()
            .find(|port| match backend.port.as_ref() {
                Some(ServiceBackendPort {
                    number: Some(number),
                    ..
                }) => port.port == *number,
                Some(ServiceBackendPort {
                    name: Some(name), ..
                }) => port.name.as_deref() == Some(name.as_str()),
                _ => false,
            })
            .ok_or_else(|| EndpointsLookupError::PortNotFound {
                service: service_key.clone(),
                port: port_label.clone(),
            })?;

        let endpoints = self
            .endpoints
            .get(&ObjectRef::new(&service_key.name).within(&service_key.namespace))
            .ok_or_else(|| EndpointsLookupError::EndpointsNotFound {
                service: service_key.clone(),
                port: port_label.clone(),
            })?;

        let mut backends = Vec::new();
        for subset in endpoints.subsets.iter().flatten() {
            for port in subset.ports.iter().flatten() {
                if port.name != service_port.name {
                    continue;
                }
                for address in subset.addresses.iter().flatten() {
                    backends.push(format!("{}:{}", address.ip, port.port));
                }
            }
        }

        if backends.is_empty() {
            return Err(EndpointsLookupError::EndpointsNotFound {
                service: service_key,
                port: port_label,
            });
        }
        Ok(backends)
    }
}

fn port_label(port: Option<&ServiceBackendPort>) -> String {
    match port {
        Some(ServiceBackendPort {
            number: Some(number),
            ..
        }) => number.to_string(),
        Some(ServiceBackendPort {
            name: Some(name), ..
        }) => name.clone(),
        _ => String::new(),
    }
}
