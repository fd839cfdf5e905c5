use super::errors::{ConfigError, ValidationError};
use super::GlobalConfig;
use k8s_openapi::api::core::v1::ConfigMap;
use std::collections::BTreeMap;

/// Parses a ConfigMap into a [`GlobalConfig`], starting from the defaults.
///
/// Every validation failure is collected and the offending key skipped, so a
/// usable config is always returned. The three HSTS keys are applied
/// all-or-nothing: if any of them fails to parse, none is applied.
pub fn parse_config_map(cfgm: &ConfigMap) -> (GlobalConfig, Option<ValidationError>) {
    let mut cfg = GlobalConfig::default();
    let mut errors = ValidationError::default();

    let empty = BTreeMap::new();
    let data = cfgm.data.as_ref().unwrap_or(&empty);

    // Plain string keys.
    if let Some(value) = data.get("client-max-body-size") {
        cfg.client_max_body_size = value.clone();
    }
    if let Some(value) = data.get("server-names-hash-bucket-size") {
        cfg.main_server_names_hash_bucket_size = value.clone();
    }
    if let Some(value) = data.get("server-names-hash-max-size") {
        cfg.main_server_names_hash_max_size = value.clone();
    }
    if let Some(value) = data.get("proxy-connect-timeout") {
        cfg.proxy_connect_timeout = value.clone();
    }
    if let Some(value) = data.get("proxy-read-timeout") {
        cfg.proxy_read_timeout = value.clone();
    }
    if let Some(value) = data.get("real-ip-header") {
        cfg.real_ip_header = value.clone();
    }
    if let Some(value) = data.get("ssl-protocols") {
        cfg.main_ssl_protocols = value.clone();
    }
    if let Some(value) = data.get("ssl-ciphers") {
        cfg.main_ssl_ciphers = value.trim_matches('\n').to_string();
    }
    if let Some(value) = data.get("ssl-dhparam-file") {
        cfg.main_ssl_dhparam = value.trim_matches('\n').to_string();
    }
    if let Some(value) = data.get("log-format") {
        cfg.main_log_format = value.clone();
    }
    if let Some(value) = data.get("worker-shutdown-timeout") {
        cfg.main_worker_shutdown_timeout = value.clone();
    }
    if let Some(value) = data.get("proxy-buffers") {
        cfg.proxy_buffers = value.clone();
    }
    if let Some(value) = data.get("proxy-buffer-size") {
        cfg.proxy_buffer_size = value.clone();
    }
    if let Some(value) = data.get("proxy-max-temp-file-size") {
        cfg.proxy_max_temp_file_size = value.clone();
    }

    // List keys.
    if let Some(list) = split_list(data, "http-snippets", '\n') {
        cfg.main_http_snippets = list;
    }
    if let Some(list) = split_list(data, "location-snippets", '\n') {
        cfg.location_snippets = list;
    }
    if let Some(list) = split_list(data, "server-snippets", '\n') {
        cfg.server_snippets = list;
    }
    if let Some(list) = split_list(data, "proxy-hide-headers", ',') {
        cfg.proxy_hide_headers = list;
    }
    if let Some(list) = split_list(data, "proxy-pass-headers", ',') {
        cfg.proxy_pass_headers = list;
    }
    if let Some(list) = split_list(data, "set-real-ip-from", ',') {
        cfg.set_real_ip_from = list;
    }

    // Validated keys.
    apply_bool(data, "server-tokens", &mut errors, |v| cfg.server_tokens = v);
    apply_bool(data, "http2", &mut errors, |v| cfg.http2 = v);
    apply_bool(data, "redirect-to-https", &mut errors, |v| {
        cfg.redirect_to_https = v;
    });
    apply_bool(data, "proxy-protocol", &mut errors, |v| {
        cfg.proxy_protocol = v;
    });
    apply_bool(data, "real-ip-recursive", &mut errors, |v| {
        cfg.real_ip_recursive = v;
    });
    apply_bool(data, "ssl-prefer-server-ciphers", &mut errors, |v| {
        cfg.main_ssl_prefer_server_ciphers = v;
    });
    apply_bool(data, "proxy-buffering", &mut errors, |v| {
        cfg.proxy_buffering = v;
    });

    // HSTS keys are all-or-nothing.
    if let Some(hsts) = get_bool(data, "hsts") {
        let mut invalid = false;
        let hsts = match hsts {
            Ok(value) => Some(value),
            Err(err) => {
                errors.push(err);
                invalid = true;
                None
            }
        };
        let max_age = match get_i64(data, "hsts-max-age") {
            Some(Ok(value)) => Some(value),
            Some(Err(err)) => {
                errors.push(err);
                invalid = true;
                None
            }
            None => None,
        };
        let include_subdomains = match get_bool(data, "hsts-include-subdomains") {
            Some(Ok(value)) => Some(value),
            Some(Err(err)) => {
                errors.push(err);
                invalid = true;
                None
            }
            None => None,
        };

        if invalid {
            errors.push(ConfigError::HstsInvalid);
        } else {
            if let Some(hsts) = hsts {
                cfg.hsts = hsts;
            }
            if let Some(max_age) = max_age {
                cfg.hsts_max_age = max_age;
            }
            if let Some(include_subdomains) = include_subdomains {
                cfg.hsts_include_subdomains = include_subdomains;
            }
        }
    }

    (cfg, errors.into_option())
}

/// Accepts the value set of Go's `strconv.ParseBool`, which the annotations
/// of existing deployments rely on.
pub(super) fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(format!("invalid boolean {value:?}")),
    }
}

pub(super) fn split_on(value: &str, separator: char) -> Vec<String> {
    value.split(separator).map(str::to_string).collect()
}

fn split_list(data: &BTreeMap<String, String>, key: &str, separator: char) -> Option<Vec<String>> {
    data.get(key).map(|value| split_on(value, separator))
}

fn get_bool(data: &BTreeMap<String, String>, key: &str) -> Option<Result<bool, ConfigError>> {
    data.get(key).map(|value| {
        parse_bool(value).map_err(|cause| ConfigError::ConfigMapKey {
            key: key.to_string(),
            cause,
        })
    })
}

fn get_i64(data: &BTreeMap<String, String>, key: &str) -> Option<Result<i64, ConfigError>> {
    data.get(key).map(|value| {
        value
            .parse::<i64>()
            .map_err(|err| ConfigError::ConfigMapKey {
                key: key.to_string(),
                cause: err.to_string(),
            })
    })
}

fn apply_bool(
    data: &BTreeMap<String, String>,
    key: &str,
    errors: &mut ValidationError,
    apply: impl FnOnce(bool),
) {
    match get_bool(data, key) {
        Some(Ok(value)) => apply(value),
        Some(Err(err)) => errors.push(err),
        None => {}
    }
}
