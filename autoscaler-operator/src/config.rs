//! Ambient configuration layer: a typed, `clap`-derived argument struct in
//! the same style as `autoscaler_common::args` structs elsewhere in this
//! workspace (`RateLimiterArgs`, `PostgresArgs`, ...). CLI/env parsing
//! itself is treated as outer plumbing, but every binary in this corpus is
//! configured this way, so the autoscaler-operator binary is too.

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
pub struct OperatorArgs {
    /// Namespace the leader-election leases and the managed CRDs live in.
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Port the Prometheus `/metrics` (+ `/healthz`, `/readyz`) server binds.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Base URL of the IaaS HTTP API consumed by the Provisioner/Discoverer/
    /// Terminator. Internals (OAuth, circuit breaker tuning) are out of
    /// scope; this is just where the capability contract is pointed.
    #[arg(long, env = "IAAS_BASE_URL", default_value = "http://iaas.internal")]
    pub iaas_base_url: String,

    #[arg(long, env = "IAAS_API_TOKEN", default_value = "")]
    pub iaas_api_token: String,

    #[clap(flatten)]
    pub timeouts: LifecycleTimeoutArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct LifecycleTimeoutArgs {
    /// Provisioning phase wall-clock timeout, in seconds.
    #[arg(long, env = "PROVISIONING_TIMEOUT_SECS", default_value_t = 600)]
    pub provisioning_timeout_secs: u64,

    /// Joining phase wall-clock timeout, in seconds.
    #[arg(long, env = "JOINING_TIMEOUT_SECS", default_value_t = 900)]
    pub joining_timeout_secs: u64,

    /// Discoverer time bound, in seconds.
    #[arg(long, env = "DISCOVERY_TIMEOUT_SECS", default_value_t = 900)]
    pub discovery_timeout_secs: u64,

    /// Discoverer strategy-1 candidate age cutoff, in seconds.
    #[arg(long, env = "MAX_NODE_AGE_SECS", default_value_t = 1800)]
    pub max_node_age_secs: u64,

    /// Failed-state TTL, in seconds. `0` disables TTL deletion entirely,
    /// matching `LifecycleConfig::default`.
    #[arg(long, env = "FAILED_TTL_SECS", default_value_t = 0)]
    pub failed_ttl_secs: u64,
}

impl LifecycleTimeoutArgs {
    pub fn to_lifecycle_config(&self) -> crate::lifecycle::LifecycleConfig {
        crate::lifecycle::LifecycleConfig {
            provisioning_timeout: Duration::from_secs(self.provisioning_timeout_secs),
            joining_timeout: Duration::from_secs(self.joining_timeout_secs),
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            max_node_age: Duration::from_secs(self.max_node_age_secs),
            failed_ttl: Duration::from_secs(self.failed_ttl_secs),
        }
    }
}
