use super::MANAGER_NAME;
use autoscaler_types::*;
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

/// Gives access to a resource's mutable status sub-object, initializing it
/// with the default value if absent.
pub trait Object<S> {
    fn mut_status(&mut self) -> &mut S;
}

impl Object<NodeGroupStatus> for NodeGroup {
    fn mut_status(&mut self) -> &mut NodeGroupStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Object<NodeStatus> for Node {
    fn mut_status(&mut self) -> &mut NodeStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

/// Patches the resource's status sub-object with the provided function,
/// diffed against the instance's current state and applied via a JSON
/// merge patch under optimistic concurrency (server-side apply field
/// manager). The caller is responsible for retrying on conflict.
pub async fn patch_status<S, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        f(modified.mut_status());
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}

/// Patches the resource's spec (not status) the same way `patch_status`
/// patches status — used when a phase handler needs to persist spec-level
/// bookkeeping fields such as `iaasInstanceId` before the status write.
pub async fn patch_spec<T>(client: Client, instance: &T, modified: T) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource + Serialize + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
{
    let patch = Patch::Json::<T>(json_patch::diff(
        &serde_json::to_value(instance).unwrap(),
        &serde_json::to_value(&modified).unwrap(),
    ));
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}
