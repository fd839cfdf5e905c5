//! Persisted configuration records.
//!
//! These are the artifacts the controller publishes and the agent consumes.
//! File and certificate names are paths relative to the nginx configuration
//! root (`/etc/nginx` in production); the local storage backend resolves them
//! against its root directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An auxiliary file shipped alongside a config, addressed relative to the
/// nginx configuration root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    pub content: Vec<u8>,
}

/// A combined PEM bundle (certificate followed by private key).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsCertificate {
    pub name: String,
    pub content: Vec<u8>,
}

/// One rendered per-host server config.
///
/// `meta` holds the `namespace/name` keys of every Ingress that contributed
/// to this server. An empty `meta` must never be stored; the owner count
/// drives garbage collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub config: Vec<u8>,
    pub tls: Option<TlsCertificate>,
    pub files: Vec<File>,
    pub meta: BTreeMap<String, String>,
}

impl ServerConfig {
    /// The empty host denotes the default catch-all server, stored as
    /// `default`.
    pub fn file_stem(&self) -> &str {
        if self.name.is_empty() {
            "default"
        } else {
            &self.name
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The rendered main config. An empty `dhparam` means no DH parameters were
/// configured.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainConfig {
    pub config: Vec<u8>,
    pub dhparam: Vec<u8>,
    pub files: Vec<File>,
}

impl MainConfig {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_host_is_stored_as_default() {
        let cfg = ServerConfig {
            name: String::new(),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.file_stem(), "default");

        let cfg = ServerConfig {
            name: "one.example.com".into(),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.file_stem(), "one.example.com");
    }
}
