pub mod etcd;
pub mod local;

use crate::records::{MainConfig, ServerConfig};
use crate::shell::ExecError;
use async_trait::async_trait;
use thiserror::Error;

/// Key prefix under which server configs are published in etcd.
pub const SERVER_KEY_PREFIX: &str = "lbc/server/";
/// Key under which the main config is published in etcd.
pub const MAIN_CONFIG_KEY: &str = "lbc/main-config";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem transaction failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("proxy reload failed: {0}")]
    Reload(#[from] ExecError),
    #[error("etcd request failed: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("decoding stored record failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Stores per-host server configs.
///
/// Puts are idempotent: a value equal to the stored one is not written again
/// and, on the local side, does not trigger a reload.
#[async_trait]
pub trait ServerConfigStore: Send + Sync {
    async fn put(&self, cfg: &ServerConfig) -> Result<(), StoreError>;
    async fn delete(&self, cfg: &ServerConfig) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<ServerConfig>, StoreError>;
    async fn get(&self, name: &str) -> Result<Option<ServerConfig>, StoreError>;
    /// All stored configs that carry the given ingress key in their meta.
    async fn by_ingress_key(&self, ingress_key: &str) -> Result<Vec<ServerConfig>, StoreError>;
}

/// Stores the single main config.
#[async_trait]
pub trait MainConfigStore: Send + Sync {
    async fn put(&self, cfg: &MainConfig) -> Result<(), StoreError>;
    async fn get(&self) -> Result<Option<MainConfig>, StoreError>;
}
