//! The reconciler turns object state into stored configuration. It is the
//! only component that mutates the stores.

use crate::collision::{CollisionHandler, IngressServers, MergeList};
use crate::config::{
    backend_port_string, parse_config_map, parse_ingress_annotations, parse_servers,
    parse_tls_secret, GlobalConfig, Server, ValidationError, EMPTY_HOST,
};
use crate::kubernetes::accessors::{
    ConfigMapAccessor, EndpointsAccessor, IngressAccessor, SecretAccessor,
};
use crate::kubernetes::events::{
    reference_for, EventSink, REASON_CONFIG_ERROR, REASON_CONFIG_WARNINGS,
};
use crate::kubernetes::{is_managed_ingress, object_key, ObjectKey};
use crate::queue::TaskQueue;
use crate::renderer::Renderer;
use crate::watchlist::SecretWatchlist;
use derive_builder::Builder;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend};
use lbc_core::records::{ServerConfig, TlsCertificate};
use lbc_core::storage::{MainConfigStore, ServerConfigStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Transient failures are retried with this fixed backoff.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("rendering failed: {0}")]
    Render(#[from] std::fmt::Error),
    #[error("kubernetes api request failed: {0}")]
    Kube(#[from] kube::Error),
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct ReconcilerParams {
    ingresses: Arc<dyn IngressAccessor>,
    config_maps: Arc<dyn ConfigMapAccessor>,
    secrets: Arc<dyn SecretAccessor>,
    endpoints: Arc<dyn EndpointsAccessor>,
    server_store: Arc<dyn ServerConfigStore>,
    main_store: Arc<dyn MainConfigStore>,
    collision_handler: Arc<dyn CollisionHandler>,
    renderer: Renderer,
    events: Arc<dyn EventSink>,
    watchlist: Arc<SecretWatchlist>,
    ingress_queue: TaskQueue,
    ingress_class: String,
    /// When no ConfigMap is configured there is no ConfigMap sync to load the
    /// global config; seed the defaults so ingress syncs are not skipped
    /// forever.
    #[builder(default)]
    seed_default_config: bool,
}

impl ReconcilerParams {
    pub fn new_builder() -> ReconcilerParamsBuilder {
        ReconcilerParamsBuilder::default()
    }
}

#[derive(Default)]
struct State {
    global: Option<GlobalConfig>,
}

/// The map produced by the dependency walk: for every involved ingress key,
/// the stored server configs it currently owns, by host name.
type DependencyMap = HashMap<ObjectKey, HashMap<String, ServerConfig>>;

pub struct Reconciler {
    /// Serializes reconciliations and guards the process-wide global config.
    state: Mutex<State>,

    ingresses: Arc<dyn IngressAccessor>,
    config_maps: Arc<dyn ConfigMapAccessor>,
    secrets: Arc<dyn SecretAccessor>,
    endpoints: Arc<dyn EndpointsAccessor>,

    server_store: Arc<dyn ServerConfigStore>,
    main_store: Arc<dyn MainConfigStore>,

    collision_handler: Arc<dyn CollisionHandler>,
    renderer: Renderer,
    events: Arc<dyn EventSink>,
    watchlist: Arc<SecretWatchlist>,
    ingress_queue: TaskQueue,
    ingress_class: String,
}

impl Reconciler {
    pub fn new(params: ReconcilerParams) -> Self {
        let global = params.seed_default_config.then(GlobalConfig::default);
        Self {
            state: Mutex::new(State { global }),
            ingresses: params.ingresses,
            config_maps: params.config_maps,
            secrets: params.secrets,
            endpoints: params.endpoints,
            server_store: params.server_store,
            main_store: params.main_store,
            collision_handler: params.collision_handler,
            renderer: params.renderer,
            events: params.events,
            watchlist: params.watchlist,
            ingress_queue: params.ingress_queue,
            ingress_class: params.ingress_class,
        }
    }

    /// ConfigMap sync: replace the global config, publish the main config,
    /// and re-enqueue every managed Ingress.
    pub async fn config_map_updated(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().await;

        let config_map = self.config_maps.get_by_key(key);
        let (global, validation) = match config_map.as_ref() {
            Some(config_map) => parse_config_map(config_map),
            // A deleted ConfigMap falls back to the defaults.
            None => (GlobalConfig::default(), None),
        };

        if let (Some(config_map), Some(validation)) = (config_map.as_ref(), validation) {
            self.record_validation(
                reference_for(config_map.as_ref()),
                REASON_CONFIG_ERROR,
                &validation,
            )
            .await;
        }

        state.global = Some(global.clone());

        let main = self.renderer.render_main_config(&global)?;
        self.main_store.put(&main).await?;
        drop(state);

        for ingress in self.ingresses.list() {
            if !is_managed_ingress(&self.ingress_class, ingress.as_ref()) {
                continue;
            }
            if let Some(key) = object_key(ingress.as_ref()) {
                self.ingress_queue.enqueue(key);
            }
        }

        Ok(())
    }

    /// Ingress sync: handles creation, update, and deletion of the keyed
    /// Ingress, re-rendering every co-owned host and garbage-collecting
    /// hosts that lost their last owner.
    pub async fn ingress_updated(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let state = self.state.lock().await;

        let Some(global) = state.global.clone() else {
            info!(ingress = %key, "no main config loaded, skipping");
            return Ok(());
        };

        let mut updated: HashMap<ObjectKey, HashSet<String>> = HashMap::new();
        let mut updated_server_names: Vec<String> = Vec::new();
        let mut merge_list: MergeList = Vec::new();

        let primary = match self.servers_for_ingress_key(&global, key).await {
            Ok(primary) => primary,
            Err(err) => {
                if let Some(ingress) = self.ingresses.get_by_key(key) {
                    self.events
                        .warning(
                            reference_for(ingress.as_ref()),
                            REASON_CONFIG_ERROR,
                            err.to_string(),
                        )
                        .await;
                }
                return Err(err);
            }
        };

        match primary {
            Some((ingress, servers)) => {
                info!(ingress = %key, "updating");
                let names = updated.entry(key.clone()).or_default();
                for server in &servers {
                    names.insert(server.name.clone());
                    updated_server_names.push(server.name.clone());
                }
                merge_list.push(IngressServers { ingress, servers });
            }
            None => {
                info!(ingress = %key, "deleting");
                self.watchlist.remove(key);
            }
        }

        let dependency_map = self.dependency_map(key, &updated_server_names).await?;
        if dependency_map.len() > 1 {
            debug!(ingress = %key, dependencies = ?dependency_map.keys().collect::<Vec<_>>(), "has dependencies");
        }

        for ingress_key in dependency_map.keys() {
            if ingress_key == key {
                continue;
            }
            // Co-owners are parsed fresh; ingresses that vanished from the
            // cache are treated as deleted.
            let Some((ingress, servers)) = self.servers_for_ingress_key(&global, ingress_key).await?
            else {
                continue;
            };
            let names = updated.entry(ingress_key.clone()).or_default();
            for server in &servers {
                names.insert(server.name.clone());
            }
            if !servers.is_empty() {
                merge_list.push(IngressServers { ingress, servers });
            }
        }

        for merged in self.collision_handler.resolve(merge_list) {
            let record = self.renderer.render_server_config(&merged)?;
            self.server_store.put(&record).await?;
            debug!(host = %record.file_stem(), "updated host");
        }

        self.collect_garbage(&dependency_map, &updated).await?;

        Ok(())
    }

    /// Deletes stored servers this reconciliation no longer produces, but
    /// only when the keyed ingress was their single owner. Co-owned servers
    /// were re-rendered above with their remaining owners.
    async fn collect_garbage(
        &self,
        dependency_map: &DependencyMap,
        updated: &HashMap<ObjectKey, HashSet<String>>,
    ) -> Result<(), ReconcileError> {
        for (ingress_key, stored) in dependency_map {
            for (name, server) in stored {
                let still_produced = updated
                    .get(ingress_key)
                    .is_some_and(|names| names.contains(name));
                if !still_produced && server.meta.len() == 1 {
                    self.server_store.delete(server).await?;
                    debug!(host = %server.file_stem(), "deleted host");
                }
            }
        }
        Ok(())
    }

    /// Walks the Ingress <-> host ownership graph outward from `seed`,
    /// collecting the stored configs of every transitively co-owning
    /// ingress. Iterative so stack depth is independent of fan-out.
    async fn dependency_map(
        &self,
        seed: &ObjectKey,
        updated_server_names: &[String],
    ) -> Result<DependencyMap, ReconcileError> {
        let mut dependencies: DependencyMap = HashMap::new();
        let mut visited: HashSet<ObjectKey> = HashSet::new();
        let mut worklist = vec![seed.clone()];

        while let Some(key) = worklist.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }

            let mut servers = self.server_store.by_ingress_key(&key.to_string()).await?;
            if key == *seed {
                for name in updated_server_names {
                    if let Some(server) = self.server_store.get(name).await? {
                        servers.push(server);
                    }
                }
            }
            if servers.is_empty() {
                continue;
            }

            for server in &servers {
                for owner in server.meta.keys() {
                    let Ok(owner_key) = owner.parse::<ObjectKey>() else {
                        warn!(owner = %owner, "ignoring malformed ingress key in stored meta");
                        continue;
                    };
                    if !visited.contains(&owner_key) {
                        worklist.push(owner_key);
                    }
                }
            }

            let by_name = servers
                .into_iter()
                .map(|server| (server.name.clone(), server))
                .collect();
            dependencies.insert(key, by_name);
        }

        Ok(dependencies)
    }

    /// Parses one Ingress into its servers: annotations, TLS secrets, and
    /// endpoints. Returns `None` when the Ingress is gone from the cache.
    async fn servers_for_ingress_key(
        &self,
        global: &GlobalConfig,
        key: &ObjectKey,
    ) -> Result<Option<(Arc<Ingress>, Vec<Server>)>, ReconcileError> {
        let Some(ingress) = self.ingresses.get_by_key(key) else {
            return Ok(None);
        };

        let (ing_cfg, warnings) = parse_ingress_annotations(ingress.clone());
        if let Some(warnings) = warnings {
            self.record_validation(
                reference_for(ingress.as_ref()),
                REASON_CONFIG_WARNINGS,
                &warnings,
            )
            .await;
        }

        // Re-register the secrets this ingress references so secret events
        // fan back out to it.
        self.watchlist.remove(key);
        let tls_certs = self.tls_certificates(&ingress, key).await?;
        let endpoints = self.backend_endpoints(&ingress, key);

        let (servers, warnings) = parse_servers(global, &ing_cfg, &tls_certs, &endpoints);
        if let Some(warnings) = warnings {
            self.record_validation(
                reference_for(ingress.as_ref()),
                REASON_CONFIG_WARNINGS,
                &warnings,
            )
            .await;
        }

        Ok(Some((ingress, servers)))
    }

    /// Reads and validates the TLS secrets of the ingress, keyed by host.
    /// Invalid or missing secrets drop their TLS entries; the affected
    /// servers are still published, without SSL.
    async fn tls_certificates(
        &self,
        ingress: &Arc<Ingress>,
        key: &ObjectKey,
    ) -> Result<HashMap<String, TlsCertificate>, ReconcileError> {
        let mut tls_certs = HashMap::new();

        let tls_sections = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.tls.as_ref())
            .into_iter()
            .flatten();

        for tls in tls_sections {
            let Some(secret_name) = tls.secret_name.clone() else {
                continue;
            };
            self.watchlist
                .add(ObjectKey::new(&key.namespace, &secret_name), key.clone());

            let Some(secret) = self.secrets.get(&key.namespace, &secret_name).await? else {
                warn!(ingress = %key, secret = %secret_name, "tls secret not found, skipping tls section");
                self.events
                    .warning(
                        reference_for(ingress.as_ref()),
                        REASON_CONFIG_WARNINGS,
                        format!("TLS secret {}/{} not found", key.namespace, secret_name),
                    )
                    .await;
                continue;
            };

            let bundle = match parse_tls_secret(&secret) {
                Ok(bundle) => bundle,
                Err(validation) => {
                    self.record_validation(
                        reference_for(&secret),
                        REASON_CONFIG_WARNINGS,
                        &validation,
                    )
                    .await;
                    continue;
                }
            };

            match tls.hosts.as_ref() {
                Some(hosts) if !hosts.is_empty() => {
                    for host in hosts {
                        tls_certs.insert(
                            host.clone(),
                            TlsCertificate {
                                name: format!("ssl/{host}.pem"),
                                content: bundle.clone(),
                            },
                        );
                    }
                }
                _ => {
                    tls_certs.insert(
                        EMPTY_HOST.to_string(),
                        TlsCertificate {
                            name: "ssl/default.pem".into(),
                            content: bundle.clone(),
                        },
                    );
                }
            }
        }

        Ok(tls_certs)
    }

    /// Resolves every backend of the ingress to its endpoint list, keyed by
    /// `{serviceName}{port}`. Lookup failures leave the key absent; the
    /// server parser then falls back to the 502 upstream with a warning.
    fn backend_endpoints(
        &self,
        ingress: &Arc<Ingress>,
        key: &ObjectKey,
    ) -> HashMap<String, Vec<String>> {
        let mut endpoints = HashMap::new();
        let Some(spec) = ingress.spec.as_ref() else {
            return endpoints;
        };

        let mut resolve = |backend: &IngressServiceBackend| {
            match self.endpoints.endpoints_for_backend(&key.namespace, backend) {
                Ok(backends) => {
                    let port = backend_port_string(backend.port.as_ref());
                    endpoints.insert(format!("{}{}", backend.name, port), backends);
                }
                Err(err) => {
                    warn!(ingress = %key, service = %backend.name, %err, "error retrieving endpoints for ingress backend");
                }
            }
        };

        if let Some(backend) = spec
            .default_backend
            .as_ref()
            .and_then(|backend| backend.service.as_ref())
        {
            resolve(backend);
        }
        for rule in spec.rules.iter().flatten() {
            let Some(http) = rule.http.as_ref() else {
                continue;
            };
            for path in &http.paths {
                if let Some(backend) = path.backend.service.as_ref() {
                    resolve(backend);
                }
            }
        }

        endpoints
    }

    async fn record_validation(
        &self,
        reference: ObjectReference,
        reason: &str,
        validation: &ValidationError,
    ) {
        for error in validation.errors() {
            self.events
                .warning(reference.clone(), reason, error.to_string())
                .await;
        }
    }
}
