//! Watch wiring: one background task per resource feeds the object caches
//! and translates add/update/delete events into queue work.

use crate::kubernetes::{
    ingress_references_service, is_managed_ingress, object_key, ObjectKey,
};
use crate::queue::TaskQueue;
use crate::watchlist::SecretWatchlist;
use derive_builder::Builder;
use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::reflector::{Lookup, ObjectRef, Store};
use kube::runtime::watcher::Event;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Client;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Reflector-backed caches of the watched objects. Secrets are deliberately
/// not cached; they are fetched through the API on demand.
pub struct Caches {
    pub ingresses: Store<Ingress>,
    pub services: Store<Service>,
    pub endpoints: Store<Endpoints>,
    pub config_maps: Option<Store<ConfigMap>>,
}

#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into))]
pub struct SpawnWatchersParams {
    client: Client,
    #[builder(default)]
    namespace: Option<String>,
    ingress_class: String,
    #[builder(default)]
    config_map_key: Option<ObjectKey>,
    ingress_queue: TaskQueue,
    config_map_queue: TaskQueue,
    watchlist: Arc<SecretWatchlist>,
}

impl SpawnWatchersParams {
    pub fn new_builder() -> SpawnWatchersParamsBuilder {
        SpawnWatchersParamsBuilder::default()
    }
}

enum ObjectEvent<K> {
    Applied {
        object: Arc<K>,
        previous: Option<Arc<K>>,
    },
    Deleted(Arc<K>),
}

pub fn spawn_watchers(join_set: &mut JoinSet<()>, params: SpawnWatchersParams) -> Caches {
    let ingresses = {
        let queue = params.ingress_queue.clone();
        let class = params.ingress_class.clone();
        spawn_cached_watch(
            join_set,
            namespaced_api::<Ingress>(&params.client, params.namespace.as_deref()),
            move |event| handle_ingress_event(&queue, &class, event),
        )
    };

    let services = {
        let queue = params.ingress_queue.clone();
        let class = params.ingress_class.clone();
        let ingresses = ingresses.clone();
        spawn_cached_watch(
            join_set,
            namespaced_api::<Service>(&params.client, params.namespace.as_deref()),
            move |event| {
                if let Some(service) = changed_object(event) {
                    fan_out_service(&ingresses, &class, &service, &queue);
                }
            },
        )
    };

    let endpoints = {
        let queue = params.ingress_queue.clone();
        let class = params.ingress_class.clone();
        let ingresses = ingresses.clone();
        let services = services.clone();
        spawn_cached_watch(
            join_set,
            namespaced_api::<Endpoints>(&params.client, params.namespace.as_deref()),
            move |event| {
                let Some(endpoints) = changed_object(event) else {
                    return;
                };
                let Some(key) = object_key(endpoints.as_ref()) else {
                    return;
                };
                // Endpoints fan out through the service sharing their key.
                if let Some(service) = services.get(&ObjectRef::new(&key.name).within(&key.namespace))
                {
                    fan_out_service(&ingresses, &class, &service, &queue);
                }
            },
        )
    };

    {
        let queue = params.ingress_queue.clone();
        let watchlist = params.watchlist.clone();
        spawn_event_watch(
            join_set,
            namespaced_api::<Secret>(&params.client, params.namespace.as_deref()),
            move |event| {
                let Some(secret) = changed_object(event) else {
                    return;
                };
                let Some(key) = object_key(secret.as_ref()) else {
                    return;
                };
                for watcher in watchlist.watchers(&key) {
                    debug!(secret = %key, ingress = %watcher, "secret changed, re-enqueueing watcher");
                    queue.enqueue(watcher);
                }
            },
        );
    }

    let config_maps = params.config_map_key.as_ref().map(|config_map_key| {
        let queue = params.config_map_queue.clone();
        let config_map_key = config_map_key.clone();
        spawn_cached_watch(
            join_set,
            Api::<ConfigMap>::namespaced(params.client.clone(), &config_map_key.namespace),
            move |event| {
                let Some(config_map) = changed_object(event) else {
                    return;
                };
                if object_key(config_map.as_ref()).as_ref() == Some(&config_map_key) {
                    queue.enqueue(config_map_key.clone());
                }
            },
        )
    });

    Caches {
        ingresses,
        services,
        endpoints,
        config_maps,
    }
}

fn handle_ingress_event(queue: &TaskQueue, class: &str, event: ObjectEvent<Ingress>) {
    let ingress = match event {
        ObjectEvent::Applied { object, previous } => {
            if previous.is_some_and(|previous| *previous == *object) {
                return;
            }
            object
        }
        ObjectEvent::Deleted(object) => object,
    };

    if !is_managed_ingress(class, ingress.as_ref()) {
        debug!(
            ingress = ?ingress.metadata.name,
            "ignoring ingress based on its class annotation"
        );
        return;
    }
    if let Some(key) = object_key(ingress.as_ref()) {
        queue.enqueue(key);
    }
}

/// Enqueues every managed Ingress whose output depends on this service.
fn fan_out_service(
    ingresses: &Store<Ingress>,
    class: &str,
    service: &Service,
    queue: &TaskQueue,
) {
    for ingress in ingresses.state() {
        if !is_managed_ingress(class, ingress.as_ref()) {
            continue;
        }
        if ingress_references_service(ingress.as_ref(), service) {
            if let Some(key) = object_key(ingress.as_ref()) {
                queue.enqueue(key);
            }
        }
    }
}

/// The object an event is about, skipping updates without structural change.
fn changed_object<K: PartialEq>(event: ObjectEvent<K>) -> Option<Arc<K>> {
    match event {
        ObjectEvent::Applied { object, previous } => {
            if previous.is_some_and(|previous| *previous == *object) {
                None
            } else {
                Some(object)
            }
        }
        ObjectEvent::Deleted(object) => Some(object),
    }
}

fn namespaced_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Watches a resource into a reflector store and hands each event, with its
/// previous value, to `handle`.
fn spawn_cached_watch<K, F>(join_set: &mut JoinSet<()>, api: Api<K>, mut handle: F) -> Store<K>
where
    K: kube::Resource<DynamicType = ()>
        + Lookup<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    F: FnMut(ObjectEvent<K>) + Send + 'static,
{
    let (reader, writer) = reflector::store();

    join_set.spawn(async move {
        let stream = reflector(
            writer,
            watcher(api, watcher::Config::default()).default_backoff(),
        );
        pin_mut!(stream);

        let mut seen: HashMap<ObjectKey, Arc<K>> = HashMap::new();
        while let Some(event) = stream.next().await {
            dispatch(event, &mut seen, &mut handle);
        }
    });

    reader
}

/// Like [`spawn_cached_watch`] but without a cache; used for secrets, which
/// only need event fan-out.
fn spawn_event_watch<K, F>(join_set: &mut JoinSet<()>, api: Api<K>, mut handle: F)
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    F: FnMut(ObjectEvent<K>) + Send + 'static,
{
    join_set.spawn(async move {
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        pin_mut!(stream);

        let mut seen: HashMap<ObjectKey, Arc<K>> = HashMap::new();
        while let Some(event) = stream.next().await {
            dispatch(event, &mut seen, &mut handle);
        }
    });
}

fn dispatch<K, F>(
    event: Result<Event<K>, watcher::Error>,
    seen: &mut HashMap<ObjectKey, Arc<K>>,
    handle: &mut F,
) where
    K: kube::Resource<DynamicType = ()>,
    F: FnMut(ObjectEvent<K>),
{
    match event {
        Ok(Event::Apply(object)) | Ok(Event::InitApply(object)) => {
            let object = Arc::new(object);
            let Some(key) = object_key(object.as_ref()) else {
                return;
            };
            let previous = seen.insert(key, object.clone());
            handle(ObjectEvent::Applied { object, previous });
        }
        Ok(Event::Delete(object)) => {
            let object = Arc::new(object);
            if let Some(key) = object_key(object.as_ref()) {
                seen.remove(&key);
            }
            handle(ObjectEvent::Deleted(object));
        }
        Ok(Event::Init) | Ok(Event::InitDone) => {}
        Err(err) => warn!(%err, "watch stream error"),
    }
}
