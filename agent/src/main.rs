mod agent;
mod cli;
mod status;

use crate::agent::{Agent, LocalStores};
use crate::cli::Cli;
use anyhow::{anyhow, Context};
use clap::Parser;
use lbc_core::instrumentation::init_instrumentation;
use lbc_core::proxy::Nginx;
use lbc_core::shell::ShellExecutor;
use lbc_core::storage::local::{Layout, LocalMainConfigStore, LocalServerConfigStore};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_instrumentation(args.log_level());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting nginx load balancer agent"
    );

    let status_addr: SocketAddr = args.status_addr().parse().context("invalid --status-addr")?;

    let endpoints: Vec<&str> = args.etcd_endpoints().split(',').collect();
    let etcd = etcd_client::Client::connect(endpoints, None)
        .await
        .context("error connecting to etcd")?;

    let nginx = Nginx::new(Arc::new(ShellExecutor));
    let layout = Layout::default();
    let stores = LocalStores::new(
        Arc::new(LocalServerConfigStore::new(nginx.clone(), layout.clone())),
        Arc::new(LocalMainConfigStore::new(nginx.clone(), layout)),
    );

    let ready = Arc::new(AtomicBool::new(false));
    let shutdown = CancellationToken::new();

    let status_task = tokio::spawn(status::serve(status_addr, ready.clone(), shutdown.clone()));
    let agent_task = tokio::spawn({
        let agent = Agent::new(etcd, stores, ready);
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });
    let mut nginx_task = tokio::spawn({
        let nginx = nginx.clone();
        async move { nginx.run().await }
    });

    let result = tokio::select! {
        result = &mut nginx_task => match result {
            Ok(Ok(())) => Err(anyhow!("nginx process exited unexpectedly")),
            Ok(Err(err)) => Err(anyhow::Error::from(err).context("nginx process exited with error")),
            Err(err) => Err(anyhow::Error::from(err).context("nginx task failed")),
        },
        _ = shutdown_signal() => {
            info!("received shutdown signal, stopping gracefully");
            shutdown.cancel();
            if let Err(err) = nginx.stop().await {
                warn!(%err, "error stopping nginx");
            }
            let _ = nginx_task.await;
            Ok(())
        }
    };

    shutdown.cancel();
    let _ = agent_task.await;
    let _ = status_task.await;

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
