use super::errors::{ConfigError, ValidationError};
use super::{GlobalConfig, IngressConfig, Location, Server, Upstream, UpstreamServer, EMPTY_HOST};
use k8s_openapi::api::networking::v1::{IngressServiceBackend, IngressSpec, ServiceBackendPort};
use lbc_core::records::TlsCertificate;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Turns one parsed Ingress into an ordered list of per-host [`Server`]
/// descriptors.
///
/// `tls_certs` maps host names to their PEM bundles, `endpoints` maps
/// `{serviceName}{port}` to `address:port` backends. A service without
/// endpoints produces a warning and falls back to the 502 upstream.
pub fn parse_servers(
    global: &GlobalConfig,
    ing_cfg: &IngressConfig,
    tls_certs: &HashMap<String, TlsCertificate>,
    endpoints: &HashMap<String, Vec<String>>,
) -> (Vec<Server>, Option<ValidationError>) {
    let mut servers = Vec::new();
    let mut errors = ValidationError::default();

    let ingress = ing_cfg.ingress.as_ref();
    let namespace = ingress.metadata.namespace.clone().unwrap_or_default();
    let ingress_name = ingress.metadata.name.clone().unwrap_or_default();
    let spec = ingress.spec.as_ref();

    let empty_rules = Vec::new();
    let rules = spec
        .and_then(|spec| spec.rules.as_ref())
        .unwrap_or(&empty_rules);

    for rule in rules {
        let Some(http) = rule.http.as_ref() else {
            continue;
        };

        let host = rule.host.clone().unwrap_or_default();
        if host == EMPTY_HOST {
            warn!(
                namespace = %namespace,
                name = %ingress_name,
                "host field of ingress rule is empty"
            );
        }

        let mut upstreams: BTreeMap<String, Upstream> = BTreeMap::new();
        let mut locations = Vec::new();
        let mut root_location = false;

        for path in &http.paths {
            let Some(service) = path.backend.service.as_ref() else {
                continue;
            };

            let ups_name = upstream_name(&namespace, &ingress_name, &host, &service.name);
            if !upstreams.contains_key(&ups_name) {
                let (upstream, err) =
                    create_upstream(&namespace, endpoints, ups_name.clone(), service);
                if let Some(err) = err {
                    errors.push(err);
                }
                upstreams.insert(ups_name.clone(), upstream);
            }

            let location_path = match path.path.as_deref() {
                None | Some("") => "/".to_string(),
                Some(path) => path.to_string(),
            };
            let location = location_for_service(
                location_path,
                upstreams[&ups_name].clone(),
                global,
                ing_cfg,
                &service.name,
            );
            if location.path == "/" {
                root_location = true;
            }
            locations.push(location);
        }

        // A default backend fills in the root location when no rule claims it.
        if !root_location {
            if let Some(backend) = default_backend_service(spec) {
                let ups_name = upstream_name(&namespace, &ingress_name, EMPTY_HOST, &backend.name);
                if !upstreams.contains_key(&ups_name) {
                    let (upstream, err) =
                        create_upstream(&namespace, endpoints, ups_name.clone(), backend);
                    if let Some(err) = err {
                        errors.push(err);
                    }
                    upstreams.insert(ups_name.clone(), upstream);
                }
                locations.push(location_for_service(
                    "/".to_string(),
                    upstreams[&ups_name].clone(),
                    global,
                    ing_cfg,
                    &backend.name,
                ));
            }
        }

        let mut server = Server::with_defaults(global, ing_cfg);
        server.name = host;
        server.locations = locations;
        server.upstreams = upstreams.into_values().collect();
        attach_tls(&mut server, tls_certs);
        servers.push(server);
    }

    // An Ingress without rules but with a default backend yields a single
    // catch-all server.
    if rules.is_empty() {
        if let Some(backend) = default_backend_service(spec) {
            let ups_name = upstream_name(&namespace, &ingress_name, EMPTY_HOST, &backend.name);
            let (upstream, err) = create_upstream(&namespace, endpoints, ups_name, backend);
            if let Some(err) = err {
                errors.push(err);
            }

            let location = location_for_service(
                "/".to_string(),
                upstream.clone(),
                global,
                ing_cfg,
                &backend.name,
            );

            let mut server = Server::with_defaults(global, ing_cfg);
            server.name = EMPTY_HOST.to_string();
            server.locations = vec![location];
            server.upstreams = vec![upstream];
            attach_tls(&mut server, tls_certs);
            servers.push(server);
        }
    }

    (servers, errors.into_option())
}

/// Upstream names are stable under re-render for the same
/// Ingress + host + service triple.
fn upstream_name(namespace: &str, ingress_name: &str, host: &str, service: &str) -> String {
    format!("{namespace}-{ingress_name}-{host}-{service}")
}

fn location_for_service(
    path: String,
    upstream: Upstream,
    global: &GlobalConfig,
    ing_cfg: &IngressConfig,
    service: &str,
) -> Location {
    Location::with_defaults(
        path,
        upstream,
        global,
        ing_cfg,
        ing_cfg.websocket_services.contains(service),
        ing_cfg.rewrites.get(service).cloned().unwrap_or_default(),
        ing_cfg.ssl_services.contains(service),
    )
}

fn default_backend_service(spec: Option<&IngressSpec>) -> Option<&IngressServiceBackend> {
    spec.and_then(|spec| spec.default_backend.as_ref())
        .and_then(|backend| backend.service.as_ref())
}

pub(crate) fn backend_port_string(port: Option<&ServiceBackendPort>) -> String {
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

fn create_upstream(
    namespace: &str,
    endpoints: &HashMap<String, Vec<String>>,
    name: String,
    service: &IngressServiceBackend,
) -> (Upstream, Option<ConfigError>) {
    let port = backend_port_string(service.port.as_ref());
    let key = format!("{}{}", service.name, port);

    if let Some(backends) = endpoints.get(&key) {
        let servers: Vec<UpstreamServer> = backends
            .iter()
            .filter_map(|endpoint| {
                endpoint.rsplit_once(':').map(|(address, port)| UpstreamServer {
                    address: address.to_string(),
                    port: port.to_string(),
                })
            })
            .collect();

        if !servers.is_empty() {
            return (Upstream { name, servers }, None);
        }
    }

    (
        Upstream::with_default_server(name),
        Some(ConfigError::MissingEndpoints {
            namespace: namespace.to_string(),
            service: service.name.clone(),
            port,
        }),
    )
}

fn attach_tls(server: &mut Server, tls_certs: &HashMap<String, TlsCertificate>) {
    if let Some(cert) = tls_certs.get(&server.name) {
        server.ssl = true;
        server.ssl_certificate = format!("/etc/nginx/{}", cert.name);
        server.ssl_certificate_key = format!("/etc/nginx/{}", cert.name);
        server.tls = Some(cert.clone());
    }
}
