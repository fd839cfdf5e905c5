//! Resolves host collisions: multiple Ingress objects claiming the same
//! server name are reduced to one deterministic server per host.

use crate::config::{Location, Server, Upstream};
use crate::kubernetes::object_key;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};

/// The servers generated from one Ingress, tied to their source object.
pub struct IngressServers {
    pub ingress: Arc<Ingress>,
    pub servers: Vec<Server>,
}

pub type MergeList = Vec<IngressServers>;

/// The final server for one host plus every Ingress that contributed to it.
pub struct MergedIngressConfig {
    pub server: Server,
    pub ingresses: Vec<Arc<Ingress>>,
}

pub trait CollisionHandler: Send + Sync {
    fn resolve(&self, merge_list: MergeList) -> Vec<MergedIngressConfig>;
}

/// Contributions are folded oldest-first: the oldest Ingress provides the
/// server-level defaults, later ones add or override locations, merge files,
/// and monotonically enable SSL/HTTP2/HSTS.
#[derive(Debug, Default)]
pub struct MergingCollisionHandler;

impl CollisionHandler for MergingCollisionHandler {
    fn resolve(&self, mut merge_list: MergeList) -> Vec<MergedIngressConfig> {
        sort_by_age(&mut merge_list);

        let mut host_order: Vec<String> = Vec::new();
        let mut servers_by_host: HashMap<String, Vec<Server>> = HashMap::new();
        let mut ingresses_by_host: HashMap<String, Vec<Arc<Ingress>>> = HashMap::new();

        for contribution in merge_list {
            for server in contribution.servers {
                if !servers_by_host.contains_key(&server.name) {
                    host_order.push(server.name.clone());
                }
                ingresses_by_host
                    .entry(server.name.clone())
                    .or_default()
                    .push(contribution.ingress.clone());
                servers_by_host
                    .entry(server.name.clone())
                    .or_default()
                    .push(server);
            }
        }

        debug!(hosts = ?host_order, "merging server configs");

        host_order
            .into_iter()
            .filter_map(|host| {
                let mut contributions = servers_by_host.remove(&host)?.into_iter();
                let mut base = contributions.next()?;
                for server in contributions {
                    base = merge_servers(base, server);
                }
                base.upstreams = upstreams_for_server(&base);

                Some(MergedIngressConfig {
                    server: base,
                    ingresses: ingresses_by_host.remove(&host).unwrap_or_default(),
                })
            })
            .collect()
    }
}

/// First-writer-wins: the oldest Ingress claims the host, later duplicates
/// are dropped with a logged error.
#[derive(Debug, Default)]
pub struct DenyCollisionHandler;

impl CollisionHandler for DenyCollisionHandler {
    fn resolve(&self, mut merge_list: MergeList) -> Vec<MergedIngressConfig> {
        sort_by_age(&mut merge_list);

        let mut claimed: HashSet<String> = HashSet::new();
        let mut merged = Vec::new();

        for contribution in merge_list {
            for server in contribution.servers {
                if !claimed.insert(server.name.clone()) {
                    error!(
                        host = %server.name,
                        ingress = %object_key(contribution.ingress.as_ref())
                            .map(|k| k.to_string())
                            .unwrap_or_default(),
                        "host is already claimed by an older ingress, dropping"
                    );
                    continue;
                }
                merged.push(MergedIngressConfig {
                    server,
                    ingresses: vec![contribution.ingress.clone()],
                });
            }
        }

        merged
    }
}

/// Orders by creation timestamp ascending; ties are broken by the ingress key
/// so that resolution is deterministic regardless of arrival order.
fn sort_by_age(merge_list: &mut MergeList) {
    merge_list.sort_by_key(|contribution| {
        let timestamp = contribution
            .ingress
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|Time(timestamp)| timestamp.timestamp_millis());
        let key = object_key(contribution.ingress.as_ref())
            .map(|key| key.to_string())
            .unwrap_or_default();
        (timestamp, key)
    });
}

fn merge_servers(mut base: Server, merge: Server) -> Server {
    // Locations are merged path-keyed, the later contributor wins.
    let mut locations: BTreeMap<String, Location> = base
        .locations
        .into_iter()
        .map(|location| (location.path.clone(), location))
        .collect();
    for location in merge.locations {
        locations.insert(location.path.clone(), location);
    }
    base.locations = locations.into_values().collect();

    // Files merge name-keyed, newer entries replace older ones.
    if !merge.files.is_empty() {
        let mut files: BTreeMap<String, _> = base
            .files
            .into_iter()
            .map(|file| (file.name.clone(), file))
            .collect();
        for file in merge.files {
            files.insert(file.name.clone(), file);
        }
        base.files = files.into_values().collect();
    }

    // Feature flags only ever turn on; the enabling contributor supplies the
    // associated parameters.
    if merge.ssl {
        base.ssl = true;
        base.ssl_certificate = merge.ssl_certificate;
        base.ssl_certificate_key = merge.ssl_certificate_key;
        base.tls = merge.tls;
    }
    if merge.http2 {
        base.http2 = true;
    }
    if merge.hsts {
        base.hsts = true;
        base.hsts_max_age = merge.hsts_max_age;
        base.hsts_include_subdomains = merge.hsts_include_subdomains;
    }

    base
}

/// The merged upstream set is recomputed from the final location set,
/// deduplicated by name.
fn upstreams_for_server(server: &Server) -> Vec<Upstream> {
    let upstreams: BTreeMap<String, Upstream> = server
        .locations
        .iter()
        .map(|location| (location.upstream.name.clone(), location.upstream.clone()))
        .collect();
    upstreams.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalConfig, IngressConfig, UpstreamServer};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use lbc_core::records::TlsCertificate;

    fn ingress(name: &str, created_secs: i64) -> Arc<Ingress> {
        Arc::new(Ingress {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some(name.into()),
                creation_timestamp: Some(Time(
                    k8s_openapi::chrono::DateTime::from_timestamp(created_secs, 0).unwrap(),
                )),
                ..ObjectMeta::default()
            },
            ..Ingress::default()
        })
    }

    fn server(ingress: &Arc<Ingress>, host: &str, paths: &[(&str, &str)]) -> Server {
        let global = GlobalConfig::default();
        let ing_cfg = IngressConfig::new(ingress.clone());

        let mut server = Server::with_defaults(&global, &ing_cfg);
        server.name = host.to_string();
        for (path, upstream_name) in paths {
            let upstream = Upstream {
                name: (*upstream_name).to_string(),
                servers: vec![UpstreamServer {
                    address: "10.0.0.1".into(),
                    port: "80".into(),
                }],
            };
            server
                .locations
                .push(Location::with_defaults(
                    (*path).to_string(),
                    upstream.clone(),
                    &global,
                    &ing_cfg,
                    false,
                    String::new(),
                    false,
                ));
            server.upstreams.push(upstream);
        }
        server
    }

    fn names(merged: &MergedIngressConfig) -> Vec<String> {
        merged
            .ingresses
            .iter()
            .filter_map(|ing| object_key(ing.as_ref()))
            .map(|key| key.to_string())
            .collect()
    }

    #[test]
    fn newer_locations_override_older_ones_per_path() {
        // ing2 is older and forms the base; ing1's /1 wins over ing2's /1.
        let ing1 = ingress("ing1", 2_000);
        let ing2 = ingress("ing2", 1_000);

        let merge_list = vec![
            IngressServers {
                ingress: ing1.clone(),
                servers: vec![server(&ing1, "one.example.com", &[("/1", "ing1-svc1")])],
            },
            IngressServers {
                ingress: ing2.clone(),
                servers: vec![
                    server(
                        &ing2,
                        "one.example.com",
                        &[("/1", "ing2-svc1"), ("/2", "ing2-svc1")],
                    ),
                    server(&ing2, "two.example.com", &[("/3", "ing2-svc2")]),
                ],
            },
        ];

        let merged = MergingCollisionHandler.resolve(merge_list);
        assert_eq!(merged.len(), 2);

        let one = merged
            .iter()
            .find(|m| m.server.name == "one.example.com")
            .unwrap();
        assert_eq!(names(one), vec!["default/ing2", "default/ing1"]);

        let by_path: HashMap<&str, &Location> = one
            .server
            .locations
            .iter()
            .map(|l| (l.path.as_str(), l))
            .collect();
        assert_eq!(by_path["/1"].upstream.name, "ing1-svc1");
        assert_eq!(by_path["/2"].upstream.name, "ing2-svc1");

        let upstream_names: Vec<&str> = one
            .server
            .upstreams
            .iter()
            .map(|u| u.name.as_str())
            .collect();
        assert_eq!(upstream_names, vec!["ing1-svc1", "ing2-svc1"]);

        let two = merged
            .iter()
            .find(|m| m.server.name == "two.example.com")
            .unwrap();
        assert_eq!(names(two), vec!["default/ing2"]);
    }

    #[test]
    fn feature_flags_are_monotonically_enabled() {
        let ing1 = ingress("ing1", 1_000);
        let ing3 = ingress("ing3", 3_000);

        let base = server(&ing1, "one.example.com", &[("/", "ing1-svc1")]);

        let mut upgraded = server(&ing3, "one.example.com", &[("/3", "ing3-svc1")]);
        upgraded.ssl = true;
        upgraded.ssl_certificate = "/etc/nginx/ssl/one.example.com.pem".into();
        upgraded.ssl_certificate_key = "/etc/nginx/ssl/one.example.com.pem".into();
        upgraded.tls = Some(TlsCertificate {
            name: "ssl/one.example.com.pem".into(),
            content: b"ing3-pem".to_vec(),
        });
        upgraded.http2 = true;
        upgraded.hsts = true;
        upgraded.hsts_max_age = 2000;
        upgraded.hsts_include_subdomains = true;

        let merged = MergingCollisionHandler.resolve(vec![
            IngressServers {
                ingress: ing3.clone(),
                servers: vec![upgraded],
            },
            IngressServers {
                ingress: ing1.clone(),
                servers: vec![base],
            },
        ]);

        assert_eq!(merged.len(), 1);
        let server = &merged[0].server;
        assert!(server.ssl);
        assert_eq!(server.tls.as_ref().unwrap().content, b"ing3-pem");
        assert!(server.http2);
        assert!(server.hsts);
        assert_eq!(server.hsts_max_age, 2000);
        assert!(server.hsts_include_subdomains);
        assert_eq!(merged[0].ingresses.len(), 2);
    }

    #[test]
    fn resolution_is_independent_of_arrival_order() {
        let ing1 = ingress("ing1", 2_000);
        let ing2 = ingress("ing2", 1_000);

        let forward = MergingCollisionHandler.resolve(vec![
            IngressServers {
                ingress: ing1.clone(),
                servers: vec![server(&ing1, "one.example.com", &[("/1", "ing1-svc1")])],
            },
            IngressServers {
                ingress: ing2.clone(),
                servers: vec![server(&ing2, "one.example.com", &[("/1", "ing2-svc1")])],
            },
        ]);
        let backward = MergingCollisionHandler.resolve(vec![
            IngressServers {
                ingress: ing2.clone(),
                servers: vec![server(&ing2, "one.example.com", &[("/1", "ing2-svc1")])],
            },
            IngressServers {
                ingress: ing1.clone(),
                servers: vec![server(&ing1, "one.example.com", &[("/1", "ing1-svc1")])],
            },
        ]);

        assert_eq!(forward.len(), 1);
        assert_eq!(backward.len(), 1);
        assert_eq!(forward[0].server, backward[0].server);
    }

    #[test]
    fn deny_handler_keeps_only_the_oldest_claim() {
        let ing1 = ingress("ing1", 2_000);
        let ing2 = ingress("ing2", 1_000);

        let merged = DenyCollisionHandler.resolve(vec![
            IngressServers {
                ingress: ing1.clone(),
                servers: vec![server(&ing1, "one.example.com", &[("/1", "ing1-svc1")])],
            },
            IngressServers {
                ingress: ing2.clone(),
                servers: vec![server(&ing2, "one.example.com", &[("/1", "ing2-svc1")])],
            },
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].server.locations[0].upstream.name, "ing2-svc1");
        assert_eq!(names(&merged[0]), vec!["default/ing2"]);
    }
}
