pub mod accessors;
pub mod events;
pub mod watch;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// `namespace/name` identity of a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
#[error("object key must have the form <namespace>/<name>, got {0:?}")]
pub struct ParseObjectKeyError(String);

impl FromStr for ObjectKey {
    type Err = ParseObjectKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(ParseObjectKeyError(s.to_string())),
        }
    }
}

/// The key of a namespaced object; `None` when namespace or name is missing.
pub fn object_key<K: ResourceExt>(object: &K) -> Option<ObjectKey> {
    let namespace = object.namespace()?;
    let name = object.meta().name.clone()?;
    Some(ObjectKey::new(namespace, name))
}

/// An Ingress is managed iff its class annotation is absent, empty, or names
/// this controller's class.
pub fn is_managed_ingress(ingress_class: &str, ingress: &Ingress) -> bool {
    match ingress.annotations().get(INGRESS_CLASS_ANNOTATION) {
        Some(class) => class.is_empty() || class == ingress_class,
        None => true,
    }
}

/// Whether the Ingress routes to the service, through any rule backend or the
/// default backend. Used to fan service and endpoints events out to the
/// ingresses whose output they affect.
pub fn ingress_references_service(ingress: &Ingress, service: &Service) -> bool {
    let Some(service_key) = object_key(service) else {
        return false;
    };
    if ingress.namespace().as_deref() != Some(service_key.namespace.as_str()) {
        return false;
    }

    let Some(spec) = ingress.spec.as_ref() else {
        return false;
    };

    let default_matches = spec
        .default_backend
        .as_ref()
        .and_then(|backend| backend.service.as_ref())
        .is_some_and(|backend| backend.name == service_key.name);
    if default_matches {
        return true;
    }

    spec.rules
        .iter()
        .flatten()
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| http.paths.iter())
        .filter_map(|path| path.backend.service.as_ref())
        .any(|backend| backend.name == service_key.name)
}
