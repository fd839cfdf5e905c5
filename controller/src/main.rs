mod cli;
mod collision;
mod config;
mod kubernetes;
mod queue;
mod reconciler;
mod renderer;
mod watchlist;

use crate::cli::Cli;
use crate::collision::{CollisionHandler, DenyCollisionHandler, MergingCollisionHandler};
use crate::kubernetes::accessors::{
    ApiSecrets, CachedConfigMaps, CachedEndpoints, CachedIngresses, ConfigMapAccessor,
    EndpointsAccessor, IngressAccessor, SecretAccessor,
};
use crate::kubernetes::events::{EventSink, KubeEventSink};
use crate::kubernetes::watch::{spawn_watchers, SpawnWatchersParams};
use crate::kubernetes::ObjectKey;
use crate::queue::TaskQueue;
use crate::reconciler::{Reconciler, ReconcilerParams, RETRY_BACKOFF};
use crate::renderer::Renderer;
use crate::watchlist::SecretWatchlist;
use anyhow::{anyhow, Context};
use clap::Parser;
use lbc_core::instrumentation::init_instrumentation;
use lbc_core::proxy::Nginx;
use lbc_core::shell::{Executor, LogExecutor, ShellExecutor};
use lbc_core::storage::etcd::{EtcdMainConfigStore, EtcdServerConfigStore};
use lbc_core::storage::local::{Layout, LocalMainConfigStore, LocalServerConfigStore};
use lbc_core::storage::{MainConfigStore, ServerConfigStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{info, warn};

const WORKER_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_instrumentation(args.log_level());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting nginx load balancer controller"
    );

    let config_map_key: Option<ObjectKey> = args
        .nginx_configmaps()
        .as_deref()
        .map(str::parse)
        .transpose()
        .context("invalid --nginx-configmaps")?;

    let client = kube::Client::try_default()
        .await
        .context("error creating kubernetes client")?;

    let ingress_queue = TaskQueue::new();
    let config_map_queue = TaskQueue::new();
    let watchlist = Arc::new(SecretWatchlist::default());
    let mut join_set = JoinSet::new();

    let caches = spawn_watchers(
        &mut join_set,
        SpawnWatchersParams::new_builder()
            .client(client.clone())
            .namespace(args.watch_namespace().clone())
            .ingress_class(args.ingress_class().clone())
            .config_map_key(config_map_key.clone())
            .ingress_queue(ingress_queue.clone())
            .config_map_queue(config_map_queue.clone())
            .watchlist(watchlist.clone())
            .build()
            .context("error building watcher parameters")?,
    );

    let collision_handler: Arc<dyn CollisionHandler> = if args.enable_merging() {
        Arc::new(MergingCollisionHandler)
    } else {
        Arc::new(DenyCollisionHandler)
    };

    let (server_store, main_store, nginx): (
        Arc<dyn ServerConfigStore>,
        Arc<dyn MainConfigStore>,
        Option<Nginx>,
    ) = if args.server_mode() {
        info!("running in server mode");
        let endpoints: Vec<&str> = args.etcd_endpoints().split(',').collect();
        let etcd = etcd_client::Client::connect(endpoints, None)
            .await
            .context("error connecting to etcd")?;
        (
            Arc::new(EtcdServerConfigStore::new(etcd.clone())),
            Arc::new(EtcdMainConfigStore::new(etcd)),
            None,
        )
    } else {
        info!("running in local mode");
        let executor: Arc<dyn Executor> = if args.proxy_dry_run() {
            Arc::new(LogExecutor)
        } else {
            Arc::new(ShellExecutor)
        };
        let nginx = Nginx::new(executor);
        let layout = Layout::default();
        (
            Arc::new(LocalServerConfigStore::new(nginx.clone(), layout.clone())),
            Arc::new(LocalMainConfigStore::new(nginx.clone(), layout)),
            Some(nginx),
        )
    };

    let reconciler = Arc::new(Reconciler::new(
        ReconcilerParams::new_builder()
            .ingresses(Arc::new(CachedIngresses::new(caches.ingresses.clone()))
                as Arc<dyn IngressAccessor>)
            .config_maps(Arc::new(CachedConfigMaps::new(caches.config_maps.clone()))
                as Arc<dyn ConfigMapAccessor>)
            .secrets(Arc::new(ApiSecrets::new(client.clone())) as Arc<dyn SecretAccessor>)
            .endpoints(Arc::new(CachedEndpoints::new(
                caches.services.clone(),
                caches.endpoints.clone(),
            )) as Arc<dyn EndpointsAccessor>)
            .server_store(server_store)
            .main_store(main_store)
            .collision_handler(collision_handler)
            .renderer(Renderer::new(args.health_status()))
            .events(Arc::new(KubeEventSink::new(client.clone())) as Arc<dyn EventSink>)
            .watchlist(watchlist)
            .ingress_queue(ingress_queue.clone())
            .ingress_class(args.ingress_class().clone())
            .seed_default_config(config_map_key.is_none())
            .build()
            .context("error building reconciler parameters")?,
    ));

    // One worker per queue; the reconciler's internal mutex keeps ConfigMap
    // and Ingress syncs from interleaving.
    {
        let queue = ingress_queue.clone();
        let requeue = ingress_queue.clone();
        let reconciler = reconciler.clone();
        join_set.spawn(async move {
            queue
                .run(WORKER_PERIOD, move |key| {
                    let reconciler = reconciler.clone();
                    let requeue = requeue.clone();
                    async move {
                        if let Err(err) = reconciler.ingress_updated(&key).await {
                            requeue.requeue_after(key, &err, RETRY_BACKOFF);
                        }
                    }
                })
                .await;
        });
    }
    {
        let queue = config_map_queue.clone();
        let requeue = config_map_queue.clone();
        let reconciler = reconciler.clone();
        join_set.spawn(async move {
            queue
                .run(WORKER_PERIOD, move |key| {
                    let reconciler = reconciler.clone();
                    let requeue = requeue.clone();
                    async move {
                        if let Err(err) = reconciler.config_map_updated(&key).await {
                            requeue.requeue_after(key, &err, RETRY_BACKOFF);
                        }
                    }
                })
                .await;
        });
    }

    let result = match nginx {
        Some(nginx) => {
            let mut nginx_task = tokio::spawn({
                let nginx = nginx.clone();
                async move { nginx.run().await }
            });

            tokio::select! {
                result = &mut nginx_task => match result {
                    Ok(Ok(())) => Err(anyhow!("nginx process exited unexpectedly")),
                    Ok(Err(err)) => {
                        Err(anyhow::Error::from(err).context("nginx process exited with error"))
                    }
                    Err(err) => Err(anyhow::Error::from(err).context("nginx task failed")),
                },
                _ = shutdown_signal() => {
                    info!("received shutdown signal, stopping gracefully");
                    if let Err(err) = nginx.stop().await {
                        warn!(%err, "error stopping nginx");
                    }
                    let _ = nginx_task.await;
                    Ok(())
                }
            }
        }
        None => {
            let _ = shutdown_signal().await;
            info!("received shutdown signal, stopping gracefully");
            Ok(())
        }
    };

    ingress_queue.shutdown();
    config_map_queue.shutdown();
    join_set.abort_all();

    result
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}
