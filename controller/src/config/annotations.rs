use super::configmap::{parse_bool, split_on};
use super::errors::{ConfigError, ValidationError};
use super::IngressConfig;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Parses the `nginx.org/` annotations of an Ingress.
///
/// Validation failures are collected as warnings; the returned config is
/// always usable, with failed keys left at "inherit".
pub fn parse_ingress_annotations(ingress: Arc<Ingress>) -> (IngressConfig, Option<ValidationError>) {
    let mut errors = ValidationError::default();
    let empty = BTreeMap::new();
    let annotations = ingress.metadata.annotations.as_ref().unwrap_or(&empty);

    let mut cfg = IngressConfig::new(ingress.clone());

    cfg.server_tokens = get_bool(annotations, "nginx.org/server-tokens", &mut errors);
    cfg.http2 = get_bool(annotations, "nginx.org/http2", &mut errors);
    cfg.redirect_to_https = get_bool(annotations, "nginx.org/redirect-to-https", &mut errors);
    cfg.proxy_buffering = get_bool(annotations, "nginx.org/proxy-buffering", &mut errors);

    cfg.server_snippets = annotations
        .get("nginx.org/server-snippets")
        .map(|v| split_on(v, '\n'));
    cfg.location_snippets = annotations
        .get("nginx.org/location-snippets")
        .map(|v| split_on(v, '\n'));
    cfg.proxy_hide_headers = annotations
        .get("nginx.org/proxy-hide-headers")
        .map(|v| split_on(v, ','));
    cfg.proxy_pass_headers = annotations
        .get("nginx.org/proxy-pass-headers")
        .map(|v| split_on(v, ','));

    cfg.proxy_connect_timeout = annotations.get("nginx.org/proxy-connect-timeout").cloned();
    cfg.proxy_read_timeout = annotations.get("nginx.org/proxy-read-timeout").cloned();
    cfg.client_max_body_size = annotations.get("nginx.org/client-max-body-size").cloned();
    cfg.proxy_buffers = annotations.get("nginx.org/proxy-buffers").cloned();
    cfg.proxy_buffer_size = annotations.get("nginx.org/proxy-buffer-size").cloned();
    cfg.proxy_max_temp_file_size = annotations
        .get("nginx.org/proxy-max-temp-file-size")
        .cloned();

    parse_hsts(annotations, &mut cfg, &mut errors);

    cfg.websocket_services = service_set(annotations, "nginx.org/websocket-services");
    cfg.ssl_services = service_set(annotations, "nginx.org/ssl-services");
    match parse_rewrites(annotations) {
        Ok(rewrites) => cfg.rewrites = rewrites,
        Err(err) => errors.push(err),
    }

    (cfg, errors.into_option())
}

/// The HSTS annotations are applied all-or-nothing, mirroring the ConfigMap
/// rule: one bad value drops all three.
fn parse_hsts(
    annotations: &BTreeMap<String, String>,
    cfg: &mut IngressConfig,
    errors: &mut ValidationError,
) {
    let Some(hsts) = annotations.get("nginx.org/hsts") else {
        return;
    };

    let mut invalid = false;

    let hsts = match parse_bool(hsts) {
        Ok(value) => Some(value),
        Err(cause) => {
            errors.push(annotation_error("nginx.org/hsts", cause));
            invalid = true;
            None
        }
    };
    let max_age = match annotations.get("nginx.org/hsts-max-age") {
        Some(value) => match value.parse::<i64>() {
            Ok(value) => Some(value),
            Err(err) => {
                errors.push(annotation_error("nginx.org/hsts-max-age", err.to_string()));
                invalid = true;
                None
            }
        },
        None => None,
    };
    let include_subdomains = match annotations.get("nginx.org/hsts-include-subdomains") {
        Some(value) => match parse_bool(value) {
            Ok(value) => Some(value),
            Err(cause) => {
                errors.push(annotation_error("nginx.org/hsts-include-subdomains", cause));
                invalid = true;
                None
            }
        },
        None => None,
    };

    if invalid {
        errors.push(ConfigError::HstsInvalid);
    } else {
        cfg.hsts = hsts;
        cfg.hsts_max_age = max_age;
        cfg.hsts_include_subdomains = include_subdomains;
    }
}

/// `nginx.org/rewrites` holds entries of the form
/// `serviceName=<svc> rewrite=<path>`, separated by semicolons.
fn parse_rewrites(
    annotations: &BTreeMap<String, String>,
) -> Result<HashMap<String, String>, ConfigError> {
    let mut rewrites = HashMap::new();
    let Some(value) = annotations.get("nginx.org/rewrites") else {
        return Ok(rewrites);
    };

    for entry in value.split(';') {
        let (service, rewrite) = parse_rewrite_entry(entry)
            .ok_or_else(|| annotation_error("nginx.org/rewrites", format!("invalid rewrite format: {entry:?}")))?;
        rewrites.insert(service, rewrite);
    }
    Ok(rewrites)
}

fn parse_rewrite_entry(entry: &str) -> Option<(String, String)> {
    let mut parts = entry.split_whitespace();
    let service = parts.next()?.strip_prefix("serviceName=")?;
    let rewrite = parts.next()?.strip_prefix("rewrite=")?;
    if parts.next().is_some() {
        return None;
    }
    Some((service.to_string(), rewrite.to_string()))
}

fn service_set(annotations: &BTreeMap<String, String>, key: &str) -> HashSet<String> {
    annotations
        .get(key)
        .map(|value| value.split(',').map(str::to_string).collect())
        .unwrap_or_default()
}

fn get_bool(
    annotations: &BTreeMap<String, String>,
    key: &str,
    errors: &mut ValidationError,
) -> Option<bool> {
    match annotations.get(key) {
        Some(value) => match parse_bool(value) {
            Ok(value) => Some(value),
            Err(cause) => {
                errors.push(annotation_error(key, cause));
                None
            }
        },
        None => None,
    }
}

fn annotation_error(annotation: &str, cause: String) -> ConfigError {
    ConfigError::Annotation {
        annotation: annotation.to_string(),
        cause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ingress(annotations: &[(&str, &str)]) -> Arc<Ingress> {
        Arc::new(Ingress {
            metadata: ObjectMeta {
                namespace: Some("default".into()),
                name: Some("ing1".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            ..Ingress::default()
        })
    }

    #[test]
    fn absent_annotations_inherit() {
        let (cfg, errors) = parse_ingress_annotations(ingress(&[]));
        assert!(errors.is_none());
        assert!(cfg.server_tokens.is_none());
        assert!(cfg.proxy_connect_timeout.is_none());
        assert!(cfg.websocket_services.is_empty());
    }

    #[test]
    fn overrides_are_parsed() {
        let (cfg, errors) = parse_ingress_annotations(ingress(&[
            ("nginx.org/server-tokens", "false"),
            ("nginx.org/proxy-read-timeout", "120s"),
            ("nginx.org/websocket-services", "ws1,ws2"),
            ("nginx.org/ssl-services", "secure"),
        ]));

        assert!(errors.is_none());
        assert_eq!(cfg.server_tokens, Some(false));
        assert_eq!(cfg.proxy_read_timeout.as_deref(), Some("120s"));
        assert!(cfg.websocket_services.contains("ws1"));
        assert!(cfg.websocket_services.contains("ws2"));
        assert!(cfg.ssl_services.contains("secure"));
    }

    #[test]
    fn rewrites_are_parsed() {
        let (cfg, errors) = parse_ingress_annotations(ingress(&[(
            "nginx.org/rewrites",
            "serviceName=svc1 rewrite=/one;serviceName=svc2 rewrite=/two",
        )]));

        assert!(errors.is_none());
        assert_eq!(cfg.rewrites.get("svc1").map(String::as_str), Some("/one"));
        assert_eq!(cfg.rewrites.get("svc2").map(String::as_str), Some("/two"));
    }

    #[test]
    fn malformed_rewrite_is_a_warning() {
        let (cfg, errors) =
            parse_ingress_annotations(ingress(&[("nginx.org/rewrites", "what-is-this")]));

        assert!(cfg.rewrites.is_empty());
        let errors = errors.unwrap();
        assert!(matches!(
            &errors.errors()[0],
            ConfigError::Annotation { annotation, .. } if annotation == "nginx.org/rewrites"
        ));
    }

    #[test]
    fn invalid_bool_is_a_warning_and_inherits() {
        let (cfg, errors) = parse_ingress_annotations(ingress(&[("nginx.org/http2", "yep")]));

        assert!(cfg.http2.is_none());
        assert!(errors.is_some());
    }

    #[test]
    fn hsts_annotations_are_all_or_nothing() {
        let (cfg, errors) = parse_ingress_annotations(ingress(&[
            ("nginx.org/hsts", "true"),
            ("nginx.org/hsts-max-age", "nope"),
            ("nginx.org/hsts-include-subdomains", "true"),
        ]));

        assert!(cfg.hsts.is_none());
        assert!(cfg.hsts_max_age.is_none());
        assert!(cfg.hsts_include_subdomains.is_none());
        assert!(errors
            .unwrap()
            .errors()
            .iter()
            .any(|e| matches!(e, ConfigError::HstsInvalid)));
    }

    #[test]
    fn valid_hsts_annotations_apply() {
        let (cfg, _) = parse_ingress_annotations(ingress(&[
            ("nginx.org/hsts", "true"),
            ("nginx.org/hsts-max-age", "2000"),
            ("nginx.org/hsts-include-subdomains", "true"),
        ]));

        assert_eq!(cfg.hsts, Some(true));
        assert_eq!(cfg.hsts_max_age, Some(2000));
        assert_eq!(cfg.hsts_include_subdomains, Some(true));
    }
}
