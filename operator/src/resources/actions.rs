use crate::util::{Error, now_rfc3339, patch::patch_status};
use kube::Client;
use vidra_types::*;

/// Marks the apply pass as in progress.
pub async fn running(client: Client, instance: &VidraResource) -> Result<(), Error> {
    patch_status(client, instance, |status: &mut VidraResourceStatus| {
        status.deploy_state = State::Running;
    })
    .await?;
    Ok(())
}

/// Records a completed pass in one status write: the rebuilt managed-object
/// index, an adoption warning if one came up, the sync time and the
/// generation this pass observed.
pub async fn succeeded(
    client: Client,
    instance: &VidraResource,
    managed: Vec<ManagedResource>,
    warning: Option<String>,
) -> Result<(), Error> {
    let generation = instance.metadata.generation;
    patch_status(client, instance, move |status: &mut VidraResourceStatus| {
        status.deploy_state = State::Succeeded;
        status.managed_resources = managed;
        status.last_error = warning;
        status.last_sync_time = Some(now_rfc3339());
        status.observed_generation = generation;
    })
    .await?;
    Ok(())
}

/// Surfaces a failed pass on the resource.
pub async fn failed(client: Client, instance: &VidraResource, err: &Error) -> Result<(), Error> {
    let generation = instance.metadata.generation;
    let message = err.to_string();
    patch_status(client, instance, move |status: &mut VidraResourceStatus| {
        status.deploy_state = State::Failed;
        status.last_error = Some(message);
        status.last_sync_time = Some(now_rfc3339());
        status.observed_generation = generation;
    })
    .await?;
    Ok(())
}

/// A managed object could not be deleted and lingers in the cluster.
/// Distinct from `Failed` so operators can tell cleanup debt apart from
/// broken syncs; the next clean pass moves the state back to `Succeeded`.
pub async fn stale(client: Client, instance: &VidraResource, err: &Error) -> Result<(), Error> {
    let generation = instance.metadata.generation;
    let message = err.to_string();
    patch_status(client, instance, move |status: &mut VidraResourceStatus| {
        status.deploy_state = State::Stale;
        status.last_error = Some(message);
        status.last_sync_time = Some(now_rfc3339());
        status.observed_generation = generation;
    })
    .await?;
    Ok(())
}
