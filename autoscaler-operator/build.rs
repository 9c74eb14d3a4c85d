use autoscaler_types::*;
use kube::CustomResourceExt;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/autoscaler.vpsie.io_nodegroup_crd.yaml",
        serde_yaml::to_string(&NodeGroup::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/autoscaler.vpsie.io_node_crd.yaml",
        serde_yaml::to_string(&Node::crd()).unwrap(),
    )
    .unwrap();
}
