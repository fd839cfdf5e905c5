//! Configuration model: process-wide defaults, per-Ingress overrides, and the
//! renderable per-host intermediates produced from them.

mod annotations;
mod configmap;
mod errors;
mod secret;
mod server;

pub use self::annotations::parse_ingress_annotations;
pub use self::configmap::parse_config_map;
pub use self::errors::{ConfigError, ValidationError};
pub use self::secret::parse_tls_secret;
pub use self::server::parse_servers;

pub(crate) use self::server::backend_port_string;

use k8s_openapi::api::networking::v1::Ingress;
use lbc_core::records::{File, TlsCertificate};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The empty host selects the default catch-all server.
pub const EMPTY_HOST: &str = "";

/// Process-wide nginx parameters, overridable per Ingress through
/// annotations. Lives for the whole process and is replaced atomically on
/// ConfigMap updates.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalConfig {
    pub location_snippets: Vec<String>,
    pub server_snippets: Vec<String>,
    pub server_tokens: bool,
    pub proxy_connect_timeout: String,
    pub proxy_read_timeout: String,
    pub client_max_body_size: String,
    pub http2: bool,
    pub redirect_to_https: bool,
    pub main_http_snippets: Vec<String>,
    pub main_server_names_hash_bucket_size: String,
    pub main_server_names_hash_max_size: String,
    pub main_log_format: String,
    pub main_worker_shutdown_timeout: String,
    pub proxy_buffering: bool,
    pub proxy_buffers: String,
    pub proxy_buffer_size: String,
    pub proxy_max_temp_file_size: String,
    pub proxy_protocol: bool,
    pub proxy_hide_headers: Vec<String>,
    pub proxy_pass_headers: Vec<String>,
    pub hsts: bool,
    pub hsts_max_age: i64,
    pub hsts_include_subdomains: bool,
    pub real_ip_header: String,
    pub set_real_ip_from: Vec<String>,
    pub real_ip_recursive: bool,
    pub main_ssl_protocols: String,
    pub main_ssl_prefer_server_ciphers: bool,
    pub main_ssl_ciphers: String,
    /// PEM content of the DH parameters, written to `ssl/dhparam.pem`.
    pub main_ssl_dhparam: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            location_snippets: Vec::new(),
            server_snippets: Vec::new(),
            server_tokens: true,
            proxy_connect_timeout: "60s".into(),
            proxy_read_timeout: "60s".into(),
            client_max_body_size: "1m".into(),
            http2: false,
            redirect_to_https: false,
            main_http_snippets: Vec::new(),
            main_server_names_hash_bucket_size: String::new(),
            main_server_names_hash_max_size: "512".into(),
            main_log_format: String::new(),
            main_worker_shutdown_timeout: "10s".into(),
            proxy_buffering: true,
            proxy_buffers: String::new(),
            proxy_buffer_size: String::new(),
            proxy_max_temp_file_size: String::new(),
            proxy_protocol: false,
            proxy_hide_headers: Vec::new(),
            proxy_pass_headers: Vec::new(),
            hsts: false,
            hsts_max_age: 2_592_000,
            hsts_include_subdomains: false,
            real_ip_header: String::new(),
            set_real_ip_from: Vec::new(),
            real_ip_recursive: false,
            main_ssl_protocols: String::new(),
            main_ssl_prefer_server_ciphers: false,
            main_ssl_ciphers: String::new(),
            main_ssl_dhparam: String::new(),
        }
    }
}

/// Per-Ingress overrides parsed from `nginx.org/` annotations. Absent fields
/// inherit from [`GlobalConfig`].
#[derive(Clone, Debug)]
pub struct IngressConfig {
    /// The Ingress the overrides were parsed from; kept for error reporting
    /// and collision resolution.
    pub ingress: Arc<Ingress>,

    pub location_snippets: Option<Vec<String>>,
    pub server_snippets: Option<Vec<String>>,
    pub server_tokens: Option<bool>,
    pub client_max_body_size: Option<String>,
    pub http2: Option<bool>,
    pub redirect_to_https: Option<bool>,
    pub proxy_buffering: Option<bool>,
    pub proxy_connect_timeout: Option<String>,
    pub proxy_read_timeout: Option<String>,
    pub proxy_buffers: Option<String>,
    pub proxy_buffer_size: Option<String>,
    pub proxy_max_temp_file_size: Option<String>,
    pub proxy_hide_headers: Option<Vec<String>>,
    pub proxy_pass_headers: Option<Vec<String>>,
    pub hsts: Option<bool>,
    pub hsts_max_age: Option<i64>,
    pub hsts_include_subdomains: Option<bool>,

    pub websocket_services: HashSet<String>,
    pub ssl_services: HashSet<String>,
    /// service name -> rewrite path
    pub rewrites: HashMap<String, String>,
}

impl IngressConfig {
    pub fn new(ingress: Arc<Ingress>) -> Self {
        Self {
            ingress,
            location_snippets: None,
            server_snippets: None,
            server_tokens: None,
            client_max_body_size: None,
            http2: None,
            redirect_to_https: None,
            proxy_buffering: None,
            proxy_connect_timeout: None,
            proxy_read_timeout: None,
            proxy_buffers: None,
            proxy_buffer_size: None,
            proxy_max_temp_file_size: None,
            proxy_hide_headers: None,
            proxy_pass_headers: None,
            hsts: None,
            hsts_max_age: None,
            hsts_include_subdomains: None,
            websocket_services: HashSet::new(),
            ssl_services: HashSet::new(),
            rewrites: HashMap::new(),
        }
    }
}

/// A renderable per-host server descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct Server {
    pub name: String,
    pub locations: Vec<Location>,
    pub upstreams: Vec<Upstream>,
    pub ssl: bool,
    pub ssl_certificate: String,
    pub ssl_certificate_key: String,
    /// The PEM bundle backing `ssl_certificate`, embedded by value.
    pub tls: Option<TlsCertificate>,
    pub files: Vec<File>,

    pub server_snippets: Vec<String>,
    pub server_tokens: bool,
    pub http2: bool,
    pub redirect_to_https: bool,
    pub proxy_protocol: bool,
    pub hsts: bool,
    pub hsts_max_age: i64,
    pub hsts_include_subdomains: bool,
    pub proxy_hide_headers: Vec<String>,
    pub proxy_pass_headers: Vec<String>,
    pub real_ip_header: String,
    pub set_real_ip_from: Vec<String>,
    pub real_ip_recursive: bool,
}

impl Server {
    /// A server carrying the global defaults with the Ingress overrides
    /// applied, without name or locations yet.
    pub fn with_defaults(global: &GlobalConfig, ing: &IngressConfig) -> Self {
        Self {
            name: String::new(),
            locations: Vec::new(),
            upstreams: Vec::new(),
            ssl: false,
            ssl_certificate: String::new(),
            ssl_certificate_key: String::new(),
            tls: None,
            files: Vec::new(),
            server_snippets: override_or(&global.server_snippets, &ing.server_snippets),
            server_tokens: override_or(&global.server_tokens, &ing.server_tokens),
            http2: override_or(&global.http2, &ing.http2),
            redirect_to_https: override_or(&global.redirect_to_https, &ing.redirect_to_https),
            proxy_protocol: global.proxy_protocol,
            hsts: override_or(&global.hsts, &ing.hsts),
            hsts_max_age: override_or(&global.hsts_max_age, &ing.hsts_max_age),
            hsts_include_subdomains: override_or(
                &global.hsts_include_subdomains,
                &ing.hsts_include_subdomains,
            ),
            proxy_hide_headers: override_or(&global.proxy_hide_headers, &ing.proxy_hide_headers),
            proxy_pass_headers: override_or(&global.proxy_pass_headers, &ing.proxy_pass_headers),
            real_ip_header: global.real_ip_header.clone(),
            set_real_ip_from: global.set_real_ip_from.clone(),
            real_ip_recursive: global.real_ip_recursive,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Location {
    pub path: String,
    pub upstream: Upstream,
    pub location_snippets: Vec<String>,
    pub proxy_connect_timeout: String,
    pub proxy_read_timeout: String,
    pub client_max_body_size: String,
    pub websocket: bool,
    pub rewrite: String,
    pub ssl: bool,
    pub proxy_buffering: bool,
    pub proxy_buffers: String,
    pub proxy_buffer_size: String,
    pub proxy_max_temp_file_size: String,
}

impl Location {
    #[allow(clippy::too_many_arguments)]
    pub fn with_defaults(
        path: String,
        upstream: Upstream,
        global: &GlobalConfig,
        ing: &IngressConfig,
        websocket: bool,
        rewrite: String,
        ssl: bool,
    ) -> Self {
        Self {
            path,
            upstream,
            websocket,
            rewrite,
            ssl,
            location_snippets: override_or(&global.location_snippets, &ing.location_snippets),
            proxy_connect_timeout: override_or(
                &global.proxy_connect_timeout,
                &ing.proxy_connect_timeout,
            ),
            proxy_read_timeout: override_or(&global.proxy_read_timeout, &ing.proxy_read_timeout),
            client_max_body_size: override_or(
                &global.client_max_body_size,
                &ing.client_max_body_size,
            ),
            proxy_buffering: override_or(&global.proxy_buffering, &ing.proxy_buffering),
            proxy_buffers: override_or(&global.proxy_buffers, &ing.proxy_buffers),
            proxy_buffer_size: override_or(&global.proxy_buffer_size, &ing.proxy_buffer_size),
            proxy_max_temp_file_size: override_or(
                &global.proxy_max_temp_file_size,
                &ing.proxy_max_temp_file_size,
            ),
        }
    }
}

/// An nginx upstream: a named, ordered set of backend servers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub servers: Vec<UpstreamServer>,
}

impl Upstream {
    /// An upstream whose single server always answers 502. Used for services
    /// that currently have no endpoints, so that an endpoint-less service
    /// degrades to a failing proxy instead of a broken configuration.
    pub fn with_default_server(name: String) -> Self {
        Self {
            name,
            servers: vec![UpstreamServer {
                address: "127.0.0.1".into(),
                port: "8181".into(),
            }],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamServer {
    pub address: String,
    pub port: String,
}

fn override_or<T: Clone>(default: &T, overridden: &Option<T>) -> T {
    match overridden {
        Some(value) => value.clone(),
        None => default.clone(),
    }
}
