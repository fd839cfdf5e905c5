//! Filesystem-backed stores driving a local nginx instance.
//!
//! A successful put means the files are on disk and nginx has been reloaded
//! with a configuration that passed `nginx -t`; on any failure the touched
//! files are rolled back to their previous state.

mod transaction;

pub use self::transaction::Transaction;

use crate::proxy::Nginx;
use crate::records::{MainConfig, ServerConfig};
use crate::storage::{MainConfigStore, ServerConfigStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Resolves record-relative file names against the nginx configuration root.
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self::rooted("/etc/nginx")
    }
}

impl Layout {
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn main_config(&self) -> PathBuf {
        self.root.join("nginx.conf")
    }

    pub fn server_config(&self, cfg: &ServerConfig) -> PathBuf {
        self.root
            .join("conf.d")
            .join(format!("{}.conf", cfg.file_stem()))
    }

    pub fn dhparam(&self) -> PathBuf {
        self.root.join("ssl").join("dhparam.pem")
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

pub struct LocalServerConfigStore {
    nginx: Nginx,
    layout: Layout,
    state: Mutex<HashMap<String, ServerConfig>>,
}

impl LocalServerConfigStore {
    pub fn new(nginx: Nginx, layout: Layout) -> Self {
        Self {
            nginx,
            layout,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn stage_put(&self, t: &mut Transaction, cfg: &ServerConfig) -> Result<(), StoreError> {
        t.update(&self.layout.server_config(cfg), &cfg.config)?;
        if let Some(tls) = &cfg.tls {
            t.update(&self.layout.resolve(&tls.name), &tls.content)?;
        }
        for file in &cfg.files {
            t.update(&self.layout.resolve(&file.name), &file.content)?;
        }
        Ok(())
    }

    fn stage_delete(&self, t: &mut Transaction, cfg: &ServerConfig) -> Result<(), StoreError> {
        t.delete(&self.layout.server_config(cfg))?;
        if let Some(tls) = &cfg.tls {
            t.delete(&self.layout.resolve(&tls.name))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ServerConfigStore for LocalServerConfigStore {
    async fn put(&self, cfg: &ServerConfig) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        if state.get(&cfg.name) == Some(cfg) {
            info!(name = %cfg.file_stem(), "resource is already up to date, skipped");
            return Ok(());
        }

        debug!(name = %cfg.file_stem(), meta = ?cfg.meta, "put");
        let mut t = Transaction::new();
        let result = match self.stage_put(&mut t, cfg) {
            Ok(()) => self.nginx.reload().await.map_err(StoreError::from),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                t.apply();
                state.insert(cfg.name.clone(), cfg.clone());
                Ok(())
            }
            Err(err) => {
                t.rollback();
                Err(err)
            }
        }
    }

    async fn delete(&self, cfg: &ServerConfig) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        debug!(name = %cfg.file_stem(), meta = ?cfg.meta, "delete");
        let mut t = Transaction::new();
        let result = match self.stage_delete(&mut t, cfg) {
            Ok(()) => self.nginx.reload().await.map_err(StoreError::from),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                t.apply();
                state.remove(&cfg.name);
                Ok(())
            }
            Err(err) => {
                t.rollback();
                Err(err)
            }
        }
    }

    async fn list(&self) -> Result<Vec<ServerConfig>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<ServerConfig>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.get(name).cloned())
    }

    async fn by_ingress_key(&self, ingress_key: &str) -> Result<Vec<ServerConfig>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .values()
            .filter(|cfg| cfg.meta.contains_key(ingress_key))
            .cloned()
            .collect())
    }
}

pub struct LocalMainConfigStore {
    nginx: Nginx,
    layout: Layout,
    state: Mutex<Option<MainConfig>>,
}

impl LocalMainConfigStore {
    pub fn new(nginx: Nginx, layout: Layout) -> Self {
        Self {
            nginx,
            layout,
            state: Mutex::new(None),
        }
    }

    fn stage_put(&self, t: &mut Transaction, cfg: &MainConfig) -> Result<(), StoreError> {
        t.update(&self.layout.main_config(), &cfg.config)?;
        if !cfg.dhparam.is_empty() {
            t.update(&self.layout.dhparam(), &cfg.dhparam)?;
        }
        for file in &cfg.files {
            t.update(&self.layout.resolve(&file.name), &file.content)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MainConfigStore for LocalMainConfigStore {
    async fn put(&self, cfg: &MainConfig) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        if state.as_ref() == Some(cfg) {
            info!("main config is already up to date, skipped");
            return Ok(());
        }

        debug!("put main config");
        let mut t = Transaction::new();
        let result = match self.stage_put(&mut t, cfg) {
            Ok(()) => self.nginx.reload().await.map_err(StoreError::from),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                t.apply();
                *state = Some(cfg.clone());
                Ok(())
            }
            Err(err) => {
                t.rollback();
                Err(err)
            }
        }
    }

    async fn get(&self) -> Result<Option<MainConfig>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TlsCertificate;
    use crate::shell::{ExecError, Executor};
    use std::fs;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeNginx {
        reloads: AtomicUsize,
        fail_config_test: AtomicBool,
    }

    #[async_trait]
    impl Executor for FakeNginx {
        async fn exec(&self, command: &str) -> Result<(), ExecError> {
            if command == "nginx -t" && self.fail_config_test.load(Ordering::SeqCst) {
                return Err(ExecError::Failed {
                    command: command.to_string(),
                    status: ExitStatus::from_raw(1),
                    output: "config test failed".into(),
                });
            }
            if command == "nginx -s reload" {
                self.reloads.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn store(dir: &TempDir) -> (LocalServerConfigStore, Arc<FakeNginx>) {
        let executor = Arc::new(FakeNginx::default());
        let nginx = Nginx::new(executor.clone());
        let store = LocalServerConfigStore::new(nginx, Layout::rooted(dir.path()));
        (store, executor)
    }

    fn server_config(name: &str, body: &[u8]) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            config: body.to_vec(),
            tls: None,
            files: Vec::new(),
            meta: [("default/ing1".to_string(), String::new())].into(),
        }
    }

    #[tokio::test]
    async fn put_writes_config_and_reloads() {
        let dir = TempDir::new().unwrap();
        let (store, executor) = store(&dir);

        let cfg = server_config("one.example.com", b"server {}\n");
        store.put(&cfg).await.unwrap();

        let written = fs::read(dir.path().join("conf.d/one.example.com.conf")).unwrap();
        assert_eq!(written, b"server {}\n");
        assert_eq!(executor.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn put_of_equal_config_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (store, executor) = store(&dir);

        let cfg = server_config("one.example.com", b"server {}\n");
        store.put(&cfg).await.unwrap();
        store.put(&cfg).await.unwrap();

        assert_eq!(executor.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_host_is_written_as_default_conf() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);

        store.put(&server_config("", b"server {}\n")).await.unwrap();
        assert!(dir.path().join("conf.d/default.conf").exists());
    }

    #[tokio::test]
    async fn failed_reload_rolls_back_all_files() {
        let dir = TempDir::new().unwrap();
        let (store, executor) = store(&dir);

        let mut cfg = server_config("one.example.com", b"server {}\n");
        store.put(&cfg).await.unwrap();

        executor.fail_config_test.store(true, Ordering::SeqCst);
        cfg.config = b"server { broken }\n".to_vec();
        cfg.tls = Some(TlsCertificate {
            name: "ssl/one.example.com.pem".into(),
            content: b"pem".to_vec(),
        });

        let err = store.put(&cfg).await.unwrap_err();
        assert!(matches!(err, StoreError::Reload(_)));

        let on_disk = fs::read(dir.path().join("conf.d/one.example.com.conf")).unwrap();
        assert_eq!(on_disk, b"server {}\n");
        assert!(!dir.path().join("ssl/one.example.com.pem").exists());

        // The cached value still reflects the last successful put.
        let cached = store.get("one.example.com").await.unwrap().unwrap();
        assert_eq!(cached.config, b"server {}\n");
    }

    #[tokio::test]
    async fn delete_removes_config_and_tls() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);

        let mut cfg = server_config("one.example.com", b"server {}\n");
        cfg.tls = Some(TlsCertificate {
            name: "ssl/one.example.com.pem".into(),
            content: b"pem".to_vec(),
        });
        store.put(&cfg).await.unwrap();
        assert!(dir.path().join("ssl/one.example.com.pem").exists());

        store.delete(&cfg).await.unwrap();
        assert!(!dir.path().join("conf.d/one.example.com.conf").exists());
        assert!(!dir.path().join("ssl/one.example.com.pem").exists());
        assert!(store.get("one.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn by_ingress_key_filters_on_meta() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);

        let mut first = server_config("one.example.com", b"a");
        first.meta = [("default/ing1".to_string(), String::new())].into();
        let mut second = server_config("two.example.com", b"b");
        second.meta = [("default/ing2".to_string(), String::new())].into();
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        let matching = store.by_ingress_key("default/ing1").await.unwrap();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].name, "one.example.com");
    }

    #[tokio::test]
    async fn main_store_writes_dhparam() {
        let dir = TempDir::new().unwrap();
        let executor = Arc::new(FakeNginx::default());
        let nginx = Nginx::new(executor.clone());
        let store = LocalMainConfigStore::new(nginx, Layout::rooted(dir.path()));

        let cfg = MainConfig {
            config: b"events {}\n".to_vec(),
            dhparam: b"dh".to_vec(),
            files: Vec::new(),
        };
        store.put(&cfg).await.unwrap();

        assert_eq!(fs::read(dir.path().join("nginx.conf")).unwrap(), b"events {}\n");
        assert_eq!(fs::read(dir.path().join("ssl/dhparam.pem")).unwrap(), b"dh");

        // Idempotent second put.
        store.put(&cfg).await.unwrap();
        assert_eq!(executor.reloads.load(Ordering::SeqCst), 1);
    }
}
