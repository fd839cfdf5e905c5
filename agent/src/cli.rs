use clap::Parser;
use getset::Getters;

#[derive(Parser, Getters, Debug)]
#[command(name = "lbc-agent", version, about = "NGINX load balancer agent")]
pub struct Cli {
    /// Comma-separated etcd endpoints.
    #[arg(long, default_value = "localhost:2379", env = "LBC_ETCD_ENDPOINTS")]
    #[getset(get = "pub")]
    etcd_endpoints: String,

    /// Address of the readiness endpoint.
    #[arg(long, default_value = "0.0.0.0:9000")]
    #[getset(get = "pub")]
    status_addr: String,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, default_value = "info")]
    #[getset(get = "pub")]
    log_level: String,
}
