//! Watches the etcd key space the controller publishes into and converges
//! the local nginx instance through the local store pair.

use etcd_client::{Client, Event, EventType, GetOptions, WatchOptions};
use lbc_core::records::{MainConfig, ServerConfig};
use lbc_core::storage::{MainConfigStore, ServerConfigStore, MAIN_CONFIG_KEY, SERVER_KEY_PREFIX};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The local store pair the agent converges. Every observed value is decoded
/// and handed to the corresponding store; decode failures are logged and
/// skipped so one bad record cannot wedge the watch loop.
#[derive(Clone)]
pub struct LocalStores {
    server: Arc<dyn ServerConfigStore>,
    main: Arc<dyn MainConfigStore>,
}

impl LocalStores {
    pub fn new(server: Arc<dyn ServerConfigStore>, main: Arc<dyn MainConfigStore>) -> Self {
        Self { server, main }
    }

    async fn apply_server_put(&self, bytes: &[u8]) {
        let cfg = match ServerConfig::decode(bytes) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(%err, "unmarshal error, skipping");
                return;
            }
        };
        if let Err(err) = self.server.put(&cfg).await {
            error!(%err, host = %cfg.file_stem(), "error updating server");
        }
    }

    async fn apply_server_delete(&self, bytes: &[u8]) {
        let cfg = match ServerConfig::decode(bytes) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(%err, "unmarshal error, skipping");
                return;
            }
        };
        if let Err(err) = self.server.delete(&cfg).await {
            error!(%err, host = %cfg.file_stem(), "error deleting server");
        }
    }

    async fn apply_main_config_put(&self, bytes: &[u8]) {
        let cfg = match MainConfig::decode(bytes) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(%err, "unmarshal error, skipping");
                return;
            }
        };
        if let Err(err) = self.main.put(&cfg).await {
            error!(%err, "error updating main config");
        }
    }

    /// Applies one server watch event. Deletes are resolved through the
    /// event's previous value, which carries the record to remove.
    async fn handle_server_event(&self, event: &Event) {
        if event.event_type() == EventType::Delete {
            let Some(prev) = event.prev_kv() else {
                warn!("server delete event without previous value, skipping");
                return;
            };
            debug!(key = ?prev.key_str().ok(), "server key deleted");
            self.apply_server_delete(prev.value()).await;
            return;
        }

        let Some(kv) = event.kv() else {
            return;
        };
        debug!(key = ?kv.key_str().ok(), "server key changed");
        self.apply_server_put(kv.value()).await;
    }

    async fn handle_main_config_event(&self, event: &Event) {
        if event.event_type() == EventType::Delete {
            // Losing the main config would break the proxy; keep serving
            // with the last one.
            error!("main config key deleted, still using old config");
            return;
        }

        let Some(kv) = event.kv() else {
            return;
        };
        debug!(key = ?kv.key_str().ok(), "main config key changed");
        self.apply_main_config_put(kv.value()).await;
    }
}

#[derive(Clone)]
pub struct Agent {
    client: Client,
    stores: LocalStores,
    ready: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(client: Client, stores: LocalStores, ready: Arc<AtomicBool>) -> Self {
        Self {
            client,
            stores,
            ready,
        }
    }

    /// Opens the watches, applies the startup snapshot, flips the readiness
    /// flag, and then runs until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let main_watcher = tokio::spawn({
            let agent = self.clone();
            async move { agent.run_main_config_watcher().await }
        });
        let server_watcher = tokio::spawn({
            let agent = self.clone();
            async move { agent.run_server_watcher().await }
        });

        self.sync_main_config().await;
        self.sync_existing_servers().await;

        self.ready.store(true, Ordering::SeqCst);
        info!("initial snapshot applied, agent ready");

        shutdown.cancelled().await;
        main_watcher.abort();
        server_watcher.abort();
    }

    async fn run_server_watcher(&self) {
        info!("starting server watcher");

        let mut client = self.client.clone();
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let (_watcher, mut stream) = match client.watch(SERVER_KEY_PREFIX, Some(options)).await {
            Ok(watch) => watch,
            Err(err) => {
                error!(%err, "error opening server watch");
                return;
            }
        };

        loop {
            match stream.message().await {
                Ok(Some(response)) => {
                    for event in response.events() {
                        self.stores.handle_server_event(event).await;
                    }
                }
                Ok(None) => {
                    info!("server watch closed");
                    return;
                }
                Err(err) => {
                    error!(%err, "server watch failed");
                    return;
                }
            }
        }
    }

    async fn run_main_config_watcher(&self) {
        info!("starting main config watcher");

        let mut client = self.client.clone();
        let options = WatchOptions::new().with_prev_key();
        let (_watcher, mut stream) = match client.watch(MAIN_CONFIG_KEY, Some(options)).await {
            Ok(watch) => watch,
            Err(err) => {
                error!(%err, "error opening main config watch");
                return;
            }
        };

        loop {
            match stream.message().await {
                Ok(Some(response)) => {
                    for event in response.events() {
                        self.stores.handle_main_config_event(event).await;
                    }
                }
                Ok(None) => {
                    info!("main config watch closed");
                    return;
                }
                Err(err) => {
                    error!(%err, "main config watch failed");
                    return;
                }
            }
        }
    }

    async fn sync_existing_servers(&self) {
        info!("syncing existing servers");

        let mut client = self.client.clone();
        let response = match client
            .get(SERVER_KEY_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "error syncing servers");
                return;
            }
        };

        for kv in response.kvs() {
            self.stores.apply_server_put(kv.value()).await;
        }
    }

    async fn sync_main_config(&self) {
        info!("syncing existing main config");

        let mut client = self.client.clone();
        let response = match client.get(MAIN_CONFIG_KEY, None).await {
            Ok(response) => response,
            Err(err) => {
                error!(%err, "error syncing main config");
                return;
            }
        };

        for kv in response.kvs() {
            self.stores.apply_main_config_put(kv.value()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbc_core::proxy::Nginx;
    use lbc_core::shell::LogExecutor;
    use lbc_core::storage::local::{Layout, LocalMainConfigStore, LocalServerConfigStore};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn stores(dir: &TempDir) -> LocalStores {
        let nginx = Nginx::new(Arc::new(LogExecutor));
        let layout = Layout::rooted(dir.path());
        LocalStores::new(
            Arc::new(LocalServerConfigStore::new(nginx.clone(), layout.clone())),
            Arc::new(LocalMainConfigStore::new(nginx, layout)),
        )
    }

    fn server_record(name: &str, body: &[u8]) -> Vec<u8> {
        ServerConfig {
            name: name.to_string(),
            config: body.to_vec(),
            tls: None,
            files: Vec::new(),
            meta: BTreeMap::from([("default/ing1".to_string(), String::new())]),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn observed_server_values_are_written_locally() {
        let dir = TempDir::new().unwrap();
        let stores = stores(&dir);

        stores
            .apply_server_put(&server_record("one.example.com", b"server {}\n"))
            .await;

        let written = fs::read(dir.path().join("conf.d/one.example.com.conf")).unwrap();
        assert_eq!(written, b"server {}\n");
    }

    #[tokio::test]
    async fn observed_server_deletes_remove_local_files() {
        let dir = TempDir::new().unwrap();
        let stores = stores(&dir);

        let record = server_record("one.example.com", b"server {}\n");
        stores.apply_server_put(&record).await;
        stores.apply_server_delete(&record).await;

        assert!(!dir.path().join("conf.d/one.example.com.conf").exists());
    }

    #[tokio::test]
    async fn observed_main_config_is_written_locally() {
        let dir = TempDir::new().unwrap();
        let stores = stores(&dir);

        let record = MainConfig {
            config: b"events {}\n".to_vec(),
            dhparam: Vec::new(),
            files: Vec::new(),
        }
        .encode()
        .unwrap();
        stores.apply_main_config_put(&record).await;

        assert_eq!(fs::read(dir.path().join("nginx.conf")).unwrap(), b"events {}\n");
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let dir = TempDir::new().unwrap();
        let stores = stores(&dir);

        stores.apply_server_put(b"not-json").await;
        assert!(!dir.path().join("conf.d").exists());
    }
}
