use clap::Parser;
use getset::{CopyGetters, Getters};

#[derive(Parser, Getters, CopyGetters, Debug)]
#[command(name = "lbc", version, about = "NGINX load balancer controller")]
pub struct Cli {
    /// Comma-separated etcd endpoints, used in server mode.
    #[arg(long, default_value = "localhost:2379", env = "LBC_ETCD_ENDPOINTS")]
    #[getset(get = "pub")]
    etcd_endpoints: String,

    /// Publish configs into etcd for agents to consume instead of driving a
    /// local nginx instance.
    #[arg(long)]
    #[getset(get_copy = "pub")]
    server_mode: bool,

    /// Namespace to watch for Ingress/Services/Endpoints; all namespaces
    /// when unset.
    #[arg(long)]
    #[getset(get = "pub")]
    watch_namespace: Option<String>,

    /// ConfigMap customizing the nginx configuration, as <namespace>/<name>.
    #[arg(long)]
    #[getset(get = "pub")]
    nginx_configmaps: Option<String>,

    /// Merge the rules of multiple ingress objects targeting the same host.
    /// Without this flag only the oldest ingress claiming a host is used and
    /// later claims are rejected.
    #[arg(long)]
    #[getset(get_copy = "pub")]
    enable_merging: bool,

    /// Add the /nginx-health location to the main nginx configuration.
    #[arg(long)]
    #[getset(get_copy = "pub")]
    health_status: bool,

    /// Write configuration but never invoke nginx. For testing.
    #[arg(long)]
    #[getset(get_copy = "pub")]
    proxy_dry_run: bool,

    /// The kubernetes.io/ingress.class value this controller manages.
    #[arg(long, default_value = "nginx")]
    #[getset(get = "pub")]
    ingress_class: String,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, default_value = "info")]
    #[getset(get = "pub")]
    log_level: String,
}
