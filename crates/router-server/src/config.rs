use std::net::SocketAddr;

use clap::Parser;

/// CLI configuration for the router's own HTTP front door. Everything a
/// generate request itself carries (sampling params, etc.) is opaque and
/// forwarded verbatim; this only configures the router.
#[derive(Debug, Parser)]
#[command(name = "router-server", about = "Affinity-aware LLM request router")]
pub struct Cli {
    /// Address to bind the router's own HTTP server on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Worker address to register at startup, e.g. `--worker http://10.0.0.1:30000`.
    /// May be repeated. The worker id is its address.
    #[arg(long = "worker", value_name = "ADDRESS")]
    pub workers: Vec<String>,

    /// Dispatch policy: affinity, round_robin, or random (case-insensitive).
    #[arg(long, default_value = "affinity")]
    pub policy: String,

    /// Match-rate threshold above which a request is pinned to its
    /// highest-affinity worker. Only meaningful for the affinity policy.
    #[arg(long, default_value_t = router_core::DEFAULT_AFFINITY_THRESHOLD)]
    pub affinity_threshold: f64,

    /// `tracing-subscriber` `EnvFilter` directive, e.g. `info` or
    /// `router_core=debug,tower_http=info`.
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
