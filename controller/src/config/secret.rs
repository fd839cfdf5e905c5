use super::errors::{ConfigError, ValidationError};
use k8s_openapi::api::core::v1::Secret;

/// Parses a TLS secret into a single PEM bundle: the certificate followed by
/// the private key, joined with a newline. Missing `tls.crt` or `tls.key` is
/// a validation error.
pub fn parse_tls_secret(secret: &Secret) -> Result<Vec<u8>, ValidationError> {
    let mut errors = ValidationError::default();

    let cert = secret
        .data
        .as_ref()
        .and_then(|data| data.get("tls.crt"))
        .map(|value| value.0.as_slice());
    if cert.is_none() {
        errors.push(ConfigError::SecretField { field: "tls.crt" });
    }

    let key = secret
        .data
        .as_ref()
        .and_then(|data| data.get("tls.key"))
        .map(|value| value.0.as_slice());
    if key.is_none() {
        errors.push(ConfigError::SecretField { field: "tls.key" });
    }

    match (cert, key) {
        (Some(cert), Some(key)) => {
            let mut bundle = Vec::with_capacity(cert.len() + key.len() + 1);
            bundle.extend_from_slice(cert);
            bundle.push(b'\n');
            bundle.extend_from_slice(key);
            Ok(bundle)
        }
        _ => Err(errors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(entries: &[(&str, &[u8])]) -> Secret {
        Secret {
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Secret::default()
        }
    }

    #[test]
    fn joins_cert_and_key() {
        let secret = secret(&[("tls.crt", b"CERT"), ("tls.key", b"KEY")]);
        assert_eq!(parse_tls_secret(&secret).unwrap(), b"CERT\nKEY");
    }

    #[test]
    fn missing_key_is_an_error() {
        let secret = secret(&[("tls.crt", b"CERT")]);
        let errors = parse_tls_secret(&secret).unwrap_err();
        assert!(matches!(
            errors.errors()[0],
            ConfigError::SecretField { field: "tls.key" }
        ));
    }

    #[test]
    fn missing_both_reports_both() {
        let errors = parse_tls_secret(&Secret::default()).unwrap_err();
        assert_eq!(errors.errors().len(), 2);
    }
}
