//! etcd-backed stores used in server mode. Values are the serialized records;
//! agents watch the key space and converge their local nginx instances.

use crate::records::{MainConfig, ServerConfig};
use crate::storage::{MainConfigStore, ServerConfigStore, StoreError, MAIN_CONFIG_KEY, SERVER_KEY_PREFIX};
use async_trait::async_trait;
use etcd_client::{Client, GetOptions};
use tracing::info;

fn server_key(cfg: &ServerConfig) -> String {
    format!("{SERVER_KEY_PREFIX}{}", cfg.file_stem())
}

pub struct EtcdServerConfigStore {
    client: Client,
}

impl EtcdServerConfigStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServerConfigStore for EtcdServerConfigStore {
    async fn put(&self, cfg: &ServerConfig) -> Result<(), StoreError> {
        if self.get(&cfg.name).await?.as_ref() == Some(cfg) {
            info!(name = %cfg.file_stem(), "resource is already up to date, skipped");
            return Ok(());
        }

        let mut client = self.client.clone();
        client.put(server_key(cfg), cfg.encode()?, None).await?;
        Ok(())
    }

    async fn delete(&self, cfg: &ServerConfig) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.delete(server_key(cfg), None).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ServerConfig>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(SERVER_KEY_PREFIX, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut configs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            configs.push(ServerConfig::decode(kv.value())?);
        }
        Ok(configs)
    }

    async fn get(&self, name: &str) -> Result<Option<ServerConfig>, StoreError> {
        let key = if name.is_empty() {
            format!("{SERVER_KEY_PREFIX}default")
        } else {
            format!("{SERVER_KEY_PREFIX}{name}")
        };

        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(ServerConfig::decode(kv.value())?)),
            None => Ok(None),
        }
    }

    async fn by_ingress_key(&self, ingress_key: &str) -> Result<Vec<ServerConfig>, StoreError> {
        let configs = self.list().await?;
        Ok(configs
            .into_iter()
            .filter(|cfg| cfg.meta.contains_key(ingress_key))
            .collect())
    }
}

pub struct EtcdMainConfigStore {
    client: Client,
}

impl EtcdMainConfigStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MainConfigStore for EtcdMainConfigStore {
    async fn put(&self, cfg: &MainConfig) -> Result<(), StoreError> {
        if self.get().await?.as_ref() == Some(cfg) {
            info!("main config is already up to date, skipped");
            return Ok(());
        }

        let mut client = self.client.clone();
        client.put(MAIN_CONFIG_KEY, cfg.encode()?, None).await?;
        Ok(())
    }

    async fn get(&self) -> Result<Option<MainConfig>, StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(MAIN_CONFIG_KEY, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(MainConfig::decode(kv.value())?)),
            None => Ok(None),
        }
    }
}
