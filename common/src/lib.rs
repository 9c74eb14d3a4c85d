pub mod metrics;
pub mod shutdown;
pub mod wait;

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub mod annotations {
    pub const CREATION_REQUESTED: &str = "autoscaler.vpsie.io/creation-requested";
    pub const MANAGED: &str = "autoscaler.vpsie.io/managed";
}

pub mod labels {
    pub const MANAGED: &str = "autoscaler.vpsie.io/managed";
    pub const NODE_GROUP: &str = "autoscaler.vpsie.io/nodegroup";
    pub const VPSIE_NODE: &str = "autoscaler.vpsie.io/vpsienode";
    pub const DATACENTER: &str = "autoscaler.vpsie.io/datacenter";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}
