//! Renders the structured config model into nginx configuration bytes.
//!
//! Rendering is a pure function of its input: equal inputs produce identical
//! bytes, which is what makes the stores' equality short-circuit meaningful.

use crate::collision::MergedIngressConfig;
use crate::config::{GlobalConfig, Location, Server};
use crate::kubernetes::object_key;
use lbc_core::records::{MainConfig, ServerConfig};
use std::collections::BTreeMap;
use std::fmt::{self, Write};

#[derive(Clone, Debug)]
pub struct Renderer {
    /// Adds the `/nginx-health` location to the main config's default server.
    health_status: bool,
}

impl Renderer {
    pub fn new(health_status: bool) -> Self {
        Self { health_status }
    }

    pub fn render_main_config(&self, cfg: &GlobalConfig) -> Result<MainConfig, fmt::Error> {
        let mut out = String::new();

        writeln!(out, "user nginx;")?;
        writeln!(out, "worker_processes auto;")?;
        writeln!(out, "worker_shutdown_timeout {};", cfg.main_worker_shutdown_timeout)?;
        writeln!(out, "error_log /var/log/nginx/error.log notice;")?;
        writeln!(out, "pid /var/run/nginx.pid;")?;
        writeln!(out)?;
        writeln!(out, "events {{")?;
        writeln!(out, "    worker_connections 1024;")?;
        writeln!(out, "}}")?;
        writeln!(out)?;
        writeln!(out, "http {{")?;
        writeln!(out, "    include /etc/nginx/mime.types;")?;
        writeln!(out, "    default_type application/octet-stream;")?;

        if !cfg.main_log_format.is_empty() {
            writeln!(out, "    log_format main '{}';", cfg.main_log_format)?;
        } else {
            writeln!(
                out,
                "    log_format main '$remote_addr - $remote_user [$time_local] \"$request\" '"
            )?;
            writeln!(
                out,
                "                    '$status $body_bytes_sent \"$http_referer\" \"$http_user_agent\"';"
            )?;
        }
        writeln!(out, "    access_log /var/log/nginx/access.log main;")?;
        writeln!(out)?;
        writeln!(out, "    sendfile on;")?;
        writeln!(out, "    keepalive_timeout 65;")?;

        if !cfg.main_server_names_hash_max_size.is_empty() {
            writeln!(
                out,
                "    server_names_hash_max_size {};",
                cfg.main_server_names_hash_max_size
            )?;
        }
        if !cfg.main_server_names_hash_bucket_size.is_empty() {
            writeln!(
                out,
                "    server_names_hash_bucket_size {};",
                cfg.main_server_names_hash_bucket_size
            )?;
        }

        if !cfg.main_ssl_protocols.is_empty() {
            writeln!(out, "    ssl_protocols {};", cfg.main_ssl_protocols)?;
        }
        if !cfg.main_ssl_ciphers.is_empty() {
            writeln!(out, "    ssl_ciphers \"{}\";", cfg.main_ssl_ciphers)?;
        }
        if cfg.main_ssl_prefer_server_ciphers {
            writeln!(out, "    ssl_prefer_server_ciphers on;")?;
        }
        if !cfg.main_ssl_dhparam.is_empty() {
            writeln!(out, "    ssl_dhparam /etc/nginx/ssl/dhparam.pem;")?;
        }

        for snippet in &cfg.main_http_snippets {
            writeln!(out, "    {snippet}")?;
        }

        if self.health_status {
            writeln!(out)?;
            writeln!(out, "    server {{")?;
            writeln!(out, "        listen 80 default_server;")?;
            writeln!(out, "        server_name _;")?;
            writeln!(out, "        location /nginx-health {{")?;
            writeln!(out, "            access_log off;")?;
            writeln!(out, "            return 200 \"healthy\\n\";")?;
            writeln!(out, "        }}")?;
            writeln!(out, "    }}")?;
        }

        writeln!(out)?;
        writeln!(out, "    include /etc/nginx/conf.d/*.conf;")?;
        writeln!(out, "}}")?;

        Ok(MainConfig {
            config: out.into_bytes(),
            dhparam: cfg.main_ssl_dhparam.clone().into_bytes(),
            files: Vec::new(),
        })
    }

    /// Renders the merged server and stamps the contributing ingress keys
    /// into the record's meta.
    pub fn render_server_config(
        &self,
        merged: &MergedIngressConfig,
    ) -> Result<ServerConfig, fmt::Error> {
        let mut out = String::new();
        render_server(&mut out, &merged.server)?;

        let meta: BTreeMap<String, String> = merged
            .ingresses
            .iter()
            .filter_map(|ingress| object_key(ingress.as_ref()))
            .map(|key| (key.to_string(), String::new()))
            .collect();

        Ok(ServerConfig {
            name: merged.server.name.clone(),
            config: out.into_bytes(),
            tls: merged.server.tls.clone(),
            files: merged.server.files.clone(),
            meta,
        })
    }
}

fn render_server(out: &mut String, server: &Server) -> fmt::Result {
    for upstream in &server.upstreams {
        writeln!(out, "upstream {} {{", upstream.name)?;
        for backend in &upstream.servers {
            writeln!(out, "    server {}:{};", backend.address, backend.port)?;
        }
        writeln!(out, "}}")?;
        writeln!(out)?;
    }

    writeln!(out, "server {{")?;
    let proxy_protocol = if server.proxy_protocol {
        " proxy_protocol"
    } else {
        ""
    };
    writeln!(out, "    listen 80{proxy_protocol};")?;
    if server.ssl {
        writeln!(out, "    listen 443 ssl{proxy_protocol};")?;
        if server.http2 {
            writeln!(out, "    http2 on;")?;
        }
        writeln!(out, "    ssl_certificate {};", server.ssl_certificate)?;
        writeln!(out, "    ssl_certificate_key {};", server.ssl_certificate_key)?;
    }

    if server.name.is_empty() {
        writeln!(out, "    server_name _;")?;
    } else {
        writeln!(out, "    server_name {};", server.name)?;
    }

    if !server.server_tokens {
        writeln!(out, "    server_tokens off;")?;
    }

    if !server.real_ip_header.is_empty() {
        writeln!(out, "    real_ip_header {};", server.real_ip_header)?;
    }
    for cidr in &server.set_real_ip_from {
        writeln!(out, "    set_real_ip_from {cidr};")?;
    }
    if server.real_ip_recursive {
        writeln!(out, "    real_ip_recursive on;")?;
    }

    if server.redirect_to_https {
        writeln!(out, "    if ($scheme = http) {{")?;
        writeln!(out, "        return 301 https://$host$request_uri;")?;
        writeln!(out, "    }}")?;
    }

    if server.hsts {
        let include_subdomains = if server.hsts_include_subdomains {
            "; includeSubDomains"
        } else {
            ""
        };
        writeln!(
            out,
            "    add_header Strict-Transport-Security \"max-age={}{}\" always;",
            server.hsts_max_age, include_subdomains
        )?;
    }

    for header in &server.proxy_hide_headers {
        writeln!(out, "    proxy_hide_header {header};")?;
    }
    for header in &server.proxy_pass_headers {
        writeln!(out, "    proxy_pass_header {header};")?;
    }

    for snippet in &server.server_snippets {
        writeln!(out, "    {snippet}")?;
    }

    for location in &server.locations {
        writeln!(out)?;
        render_location(out, location)?;
    }

    writeln!(out, "}}")?;
    Ok(())
}

fn render_location(out: &mut String, location: &Location) -> fmt::Result {
    writeln!(out, "    location {} {{", location.path)?;
    writeln!(out, "        proxy_connect_timeout {};", location.proxy_connect_timeout)?;
    writeln!(out, "        proxy_read_timeout {};", location.proxy_read_timeout)?;
    writeln!(out, "        client_max_body_size {};", location.client_max_body_size)?;

    if location.websocket {
        writeln!(out, "        proxy_http_version 1.1;")?;
        writeln!(out, "        proxy_set_header Upgrade $http_upgrade;")?;
        writeln!(out, "        proxy_set_header Connection \"upgrade\";")?;
    }

    writeln!(out, "        proxy_set_header Host $host;")?;
    writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;")?;
    writeln!(out, "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;")?;

    if location.proxy_buffering {
        writeln!(out, "        proxy_buffering on;")?;
    } else {
        writeln!(out, "        proxy_buffering off;")?;
    }
    if !location.proxy_buffers.is_empty() {
        writeln!(out, "        proxy_buffers {};", location.proxy_buffers)?;
    }
    if !location.proxy_buffer_size.is_empty() {
        writeln!(out, "        proxy_buffer_size {};", location.proxy_buffer_size)?;
    }
    if !location.proxy_max_temp_file_size.is_empty() {
        writeln!(
            out,
            "        proxy_max_temp_file_size {};",
            location.proxy_max_temp_file_size
        )?;
    }

    if !location.rewrite.is_empty() {
        writeln!(
            out,
            "        rewrite ^{}(.*)$ {}$1 break;",
            location.path, location.rewrite
        )?;
    }

    for snippet in &location.location_snippets {
        writeln!(out, "        {snippet}")?;
    }

    let scheme = if location.ssl { "https" } else { "http" };
    writeln!(out, "        proxy_pass {scheme}://{};", location.upstream.name)?;
    writeln!(out, "    }}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngressConfig, Upstream, UpstreamServer};
    use k8s_openapi::api::networking::v1::Ingress;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use lbc_core::records::TlsCertificate;
    use std::sync::Arc;

    fn merged() -> MergedIngressConfig {
        let ingress = Arc::new(Ingress {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some("ing1".into()),
                ..ObjectMeta::default()
            },
            ..Ingress::default()
        });
        let global = GlobalConfig::default();
        let ing_cfg = IngressConfig::new(ingress.clone());

        let upstream = Upstream {
            name: "default-ing1-one.example.com-svc1".into(),
            servers: vec![UpstreamServer {
                address: "8.8.8.8".into(),
                port: "9000".into(),
            }],
        };
        let mut server = Server::with_defaults(&global, &ing_cfg);
        server.name = "one.example.com".into();
        server.ssl = true;
        server.ssl_certificate = "/etc/nginx/ssl/one.example.com.pem".into();
        server.ssl_certificate_key = "/etc/nginx/ssl/one.example.com.pem".into();
        server.tls = Some(TlsCertificate {
            name: "ssl/one.example.com.pem".into(),
            content: b"pem".to_vec(),
        });
        server.locations = vec![Location::with_defaults(
            "/".into(),
            upstream.clone(),
            &global,
            &ing_cfg,
            false,
            String::new(),
            false,
        )];
        server.upstreams = vec![upstream];

        MergedIngressConfig {
            server,
            ingresses: vec![ingress],
        }
    }

    #[test]
    fn server_config_carries_meta_and_tls() {
        let record = Renderer::new(false).render_server_config(&merged()).unwrap();

        assert_eq!(record.name, "one.example.com");
        assert_eq!(record.meta.len(), 1);
        assert!(record.meta.contains_key("default/ing1"));
        assert_eq!(record.tls.as_ref().unwrap().content, b"pem");

        let text = String::from_utf8(record.config).unwrap();
        assert!(text.contains("upstream default-ing1-one.example.com-svc1 {"));
        assert!(text.contains("server 8.8.8.8:9000;"));
        assert!(text.contains("server_name one.example.com;"));
        assert!(text.contains("listen 443 ssl;"));
        assert!(text.contains("ssl_certificate /etc/nginx/ssl/one.example.com.pem;"));
        assert!(text.contains("proxy_pass http://default-ing1-one.example.com-svc1;"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let renderer = Renderer::new(false);
        let first = renderer.render_server_config(&merged()).unwrap();
        let second = renderer.render_server_config(&merged()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn main_config_reflects_global_settings() {
        let mut cfg = GlobalConfig::default();
        cfg.main_ssl_dhparam = "DH PARAMS".into();
        cfg.main_http_snippets = vec!["gzip on;".into()];

        let record = Renderer::new(true).render_main_config(&cfg).unwrap();
        let text = String::from_utf8(record.config).unwrap();

        assert!(text.contains("worker_shutdown_timeout 10s;"));
        assert!(text.contains("server_names_hash_max_size 512;"));
        assert!(text.contains("ssl_dhparam /etc/nginx/ssl/dhparam.pem;"));
        assert!(text.contains("gzip on;"));
        assert!(text.contains("location /nginx-health {"));
        assert!(text.contains("include /etc/nginx/conf.d/*.conf;"));
        assert_eq!(record.dhparam, b"DH PARAMS");
    }

    #[test]
    fn main_config_without_health_status_has_no_health_server() {
        let record = Renderer::new(false)
            .render_main_config(&GlobalConfig::default())
            .unwrap();
        let text = String::from_utf8(record.config).unwrap();
        assert!(!text.contains("/nginx-health"));
    }
}
