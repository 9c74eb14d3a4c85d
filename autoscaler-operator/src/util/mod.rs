use std::time::Duration;

pub mod colors;
pub mod metrics;
pub mod patch;

mod error;

pub use error::*;

/// The default interval for requeuing a managed resource once it is stable.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager used for server-side apply.
pub const MANAGER_NAME: &str = "autoscaler-operator";
