use crate::util::{Error, now_rfc3339, patch::patch_status};
use kube::Client;
use vidra_types::*;

/// Marks the sync as in progress.
pub async fn running(client: Client, instance: &InfrahubSync) -> Result<(), Error> {
    patch_status(client, instance, |status: &mut InfrahubSyncStatus| {
        status.sync_state = State::Running;
    })
    .await?;
    Ok(())
}

/// Records a completed sync: the projected checksums, the sync time and
/// the generation this pass observed.
pub async fn succeeded(
    client: Client,
    instance: &InfrahubSync,
    checksums: Vec<String>,
) -> Result<(), Error> {
    let generation = instance.metadata.generation;
    patch_status(client, instance, move |status: &mut InfrahubSyncStatus| {
        status.sync_state = State::Succeeded;
        status.checksums = checksums;
        status.last_error = None;
        status.last_sync_time = Some(now_rfc3339());
        status.observed_generation = generation;
    })
    .await?;
    Ok(())
}

/// Surfaces a failed sync on the resource.
pub async fn failed(client: Client, instance: &InfrahubSync, err: &Error) -> Result<(), Error> {
    let generation = instance.metadata.generation;
    let message = err.to_string();
    patch_status(client, instance, move |status: &mut InfrahubSyncStatus| {
        status.sync_state = State::Failed;
        status.last_error = Some(message);
        status.last_sync_time = Some(now_rfc3339());
        status.observed_generation = generation;
    })
    .await?;
    Ok(())
}
