use futures::stream::StreamExt;
use kube::{
    Api, Resource, ResourceExt,
    api::{ApiResource, PostParams},
    client::Client,
    discovery::Scope,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::{
    collections::HashSet,
    sync::Arc,
};
use tokio::time::Duration;
use vidra_types::*;

use super::{actions, apply};
use crate::multicluster::{ClientCache, is_local_destination};
use crate::util::{
    self, Error, FINALIZER,
    colors::{FG1, FG2},
    config::OperatorConfig,
    messages,
};
use crate::watches::WatchFabric;

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `VidraResource` controller. Leadership and shutdown
/// are handled by the caller; this runs until the task is aborted.
pub async fn run(context: Arc<ContextData>) {
    let client = context.client.clone();
    println!("{}", "🚀 VidraResource controller started.".green());
    Controller::new(Api::<VidraResource>::all(client), Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
}

/// Context injected with each `reconcile` and `on_error` method invocation.
pub struct ContextData {
    /// Client for the cluster the operator itself runs in.
    client: Client,

    /// Cached clients for remote destination clusters.
    clusters: ClientCache,

    /// Per-GVR watchers feeding event-based re-reconciliation.
    fabric: Arc<WatchFabric>,

    config: OperatorConfig,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    pub fn new(
        client: Client,
        clusters: ClientCache,
        fabric: Arc<WatchFabric>,
        config: OperatorConfig,
    ) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                clusters,
                fabric,
                config,
                metrics: ControllerMetrics::new("resource"),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                clusters,
                fabric,
                config,
            }
        }
    }
}

/// What one apply pass produced: the rebuilt managed-object index, an
/// optional ownership warning, and the GVRs to register with the fabric.
struct ApplyOutcome {
    managed: Vec<ManagedResource>,
    warning: Option<String>,
    resources: Vec<ApiResource>,
}

/// Reconciliation function for the `VidraResource` resource.
async fn reconcile(instance: Arc<VidraResource>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name])
        .inc();

    // Resolve the destination cluster first; the deletion flow needs it
    // as much as the apply path does.
    let dest = match context
        .clusters
        .client_for(&instance.spec.destination.server, &client)
        .await
    {
        Ok(dest) => dest,
        Err(err) => {
            if let Err(patch_err) = actions::failed(client, &instance, &err).await {
                eprintln!("failed to record destination error on {name}: {patch_err}");
            }
            return Err(err);
        }
    };

    if instance.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&context, &instance, dest).await;
    }

    // The spec is unchanged and nothing is due: this wake-up came from our
    // own status write. Reschedule (or go back to sleep in event mode).
    if let Some(remaining) = requeue_in(&instance, context.config.requeue_resource_after) {
        if event_mode(&context, &instance) {
            return Ok(Action::await_change());
        }
        return Ok(Action::requeue(remaining));
    }

    println!(
        "🔧 {}{}",
        name.color(FG2),
        " applying manifests".color(FG1)
    );
    actions::running(client.clone(), &instance).await?;

    if !has_finalizer(&instance) {
        if let Err(err) = add_finalizer(&client, &name).await {
            if let Err(patch_err) = actions::failed(client, &instance, &err).await {
                eprintln!("failed to record finalizer error on {name}: {patch_err}");
            }
            return Err(err);
        }
    }

    #[cfg(feature = "metrics")]
    let timer = context
        .metrics
        .write_histogram
        .with_label_values(&[&name, "apply"])
        .start_timer();

    let result = apply_pass(&context, &instance, dest).await;

    #[cfg(feature = "metrics")]
    timer.observe_duration();

    match result {
        Ok(outcome) => {
            #[cfg(feature = "metrics")]
            context
                .metrics
                .action_counter
                .with_label_values(&[&name, "Succeeded"])
                .inc();
            actions::succeeded(client.clone(), &instance, outcome.managed, outcome.warning)
                .await?;
            if event_mode(&context, &instance) && !outcome.resources.is_empty() {
                context.fabric.start_watching(&client, &outcome.resources);
            }
            if event_mode(&context, &instance) {
                // The watch fabric wakes us; no periodic requeue needed.
                Ok(Action::await_change())
            } else {
                Ok(Action::requeue(context.config.requeue_resource_after))
            }
        }
        Err(err) => {
            #[cfg(feature = "metrics")]
            context
                .metrics
                .action_counter
                .with_label_values(&[&name, "Failed"])
                .inc();
            let patched = match &err {
                Error::StaleDelete { .. } => actions::stale(client, &instance, &err).await,
                _ => actions::failed(client, &instance, &err).await,
            };
            if let Err(patch_err) = patched {
                eprintln!("failed to record apply error on {name}: {patch_err}");
            }
            Err(err)
        }
    }
}

/// Decodes the manifest, applies every object, garbage-collects objects
/// that fell out of the stream, and rebuilds the managed-object index.
async fn apply_pass(
    context: &ContextData,
    instance: &VidraResource,
    dest: Client,
) -> Result<ApplyOutcome, Error> {
    if instance.spec.manifest.is_empty() {
        return Err(Error::UserInput(
            "no manifests available in spec to reconcile".to_string(),
        ));
    }

    #[cfg(feature = "metrics")]
    let timer = context
        .metrics
        .read_histogram
        .with_label_values(&[&instance.name_any(), "decode"])
        .start_timer();

    let objects = apply::decode_manifest(&instance.spec.manifest)?;

    #[cfg(feature = "metrics")]
    timer.observe_duration();

    let local = is_local_destination(&instance.spec.destination.server);
    let events = event_mode(context, instance);
    let owner = instance.name_any();
    let destination_namespace = &instance.spec.destination.namespace;

    let mut mapper = apply::RestMapper::new(&dest);
    let mut applied: Vec<ManagedResource> = Vec::new();
    let mut applied_keys: HashSet<String> = HashSet::new();
    let mut watch_resources: Vec<ApiResource> = Vec::new();
    let mut seen_gvrs: HashSet<String> = HashSet::new();
    let mut warning: Option<String> = None;

    for mut object in objects {
        let types = object.types.clone().unwrap_or_default();
        let (ar, caps) = mapper.resolve(&types).await?;

        // Remote clusters are not watched; events only work locally.
        if events && local && seen_gvrs.insert(format!("{}/{}/{}", ar.group, ar.version, ar.plural))
        {
            watch_resources.push(ar.clone());
        }

        if caps.scope == Scope::Namespaced
            && object.namespace().is_none()
            && !destination_namespace.is_empty()
        {
            object.metadata.namespace = Some(destination_namespace.clone());
        }

        // On the local cluster the child also becomes the Kubernetes
        // owner, so built-in garbage collection backstops ours.
        if local && let Some(owner_ref) = instance.controller_owner_ref(&()) {
            object.metadata.owner_references = Some(vec![owner_ref]);
        }

        apply::mark_managed(&mut object, &owner);

        let namespace = object.namespace();
        let api = apply::dynamic_api(dest.clone(), &ar, &caps, namespace.as_deref());
        let entry = apply::managed_entry(&object);
        match apply::apply_object(&api, instance, &object).await? {
            apply::Applied::Created => {
                println!(
                    "🆕 {}{}{}",
                    owner.color(FG2),
                    " created ".color(FG1),
                    entry.key().color(FG2)
                );
            }
            apply::Applied::Updated => {
                println!(
                    "♻️ {}{}{}",
                    owner.color(FG2),
                    " updated ".color(FG1),
                    entry.key().color(FG2)
                );
            }
            apply::Applied::Unchanged => {}
            apply::Applied::Adopted { other_owners } => {
                println!(
                    "🤝 {}{}{}",
                    owner.color(FG2),
                    " adopted shared object ".color(FG1),
                    entry.key().color(FG2)
                );
                warning = Some(messages::already_managed_warning(&other_owners));
            }
            apply::Applied::SkippedDiverged { other_owners } => {
                eprintln!(
                    "skipped diverged object {} owned by {other_owners}",
                    entry.key()
                );
                warning = Some(messages::diverged_owner_warning(&other_owners, &entry.key()));
            }
        }

        if applied_keys.insert(entry.key()) {
            applied.push(entry);
        }
    }

    // Objects the previous pass managed but this one no longer declares.
    let previous = instance
        .status
        .as_ref()
        .map(|s| s.managed_resources.clone())
        .unwrap_or_default();
    for old in &previous {
        if !applied_keys.contains(&old.key()) {
            apply::delete_managed(dest.clone(), &mut mapper, instance, old).await?;
            println!(
                "🗑 {}{}{}",
                owner.color(FG2),
                " removed ".color(FG1),
                old.key().color(FG2)
            );
        }
    }

    let managed = merge_managed(&previous, &applied);
    Ok(ApplyOutcome {
        managed,
        warning,
        resources: watch_resources,
    })
}

/// Rebuilds `status.managedResources`: entries from the previous index
/// keep their position as long as they were applied again, new objects
/// are appended.
fn merge_managed(previous: &[ManagedResource], applied: &[ManagedResource]) -> Vec<ManagedResource> {
    let applied_keys: HashSet<String> = applied.iter().map(ManagedResource::key).collect();
    let mut result: Vec<ManagedResource> = previous
        .iter()
        .filter(|m| applied_keys.contains(&m.key()))
        .cloned()
        .collect();
    let kept: HashSet<String> = result.iter().map(ManagedResource::key).collect();
    for entry in applied {
        if !kept.contains(&entry.key()) {
            result.push(entry.clone());
        }
    }
    result
}

/// Deletion flow: with the finalizer present, every managed object is
/// released or deleted before the finalizer comes off and the child is
/// allowed to disappear.
async fn handle_deletion(
    context: &ContextData,
    instance: &VidraResource,
    dest: Client,
) -> Result<Action, Error> {
    if !has_finalizer(instance) {
        return Ok(Action::await_change());
    }
    let name = instance.name_any();
    println!(
        "🧹 {}{}",
        name.color(FG2),
        " releasing managed objects before deletion".color(FG1)
    );

    let mut mapper = apply::RestMapper::new(&dest);
    let previous = instance
        .status
        .as_ref()
        .map(|s| s.managed_resources.clone())
        .unwrap_or_default();
    for entry in &previous {
        if let Err(err) = apply::delete_managed(dest.clone(), &mut mapper, instance, entry).await {
            let patched = match &err {
                Error::StaleDelete { .. } => {
                    actions::stale(context.client.clone(), instance, &err).await
                }
                _ => actions::failed(context.client.clone(), instance, &err).await,
            };
            if let Err(patch_err) = patched {
                eprintln!("failed to record deletion error on {name}: {patch_err}");
            }
            return Err(err);
        }
    }

    actions::succeeded(context.client.clone(), instance, Vec::new(), None).await?;
    remove_finalizer(&context.client, &name).await?;
    Ok(Action::await_change())
}

fn event_mode(context: &ContextData, instance: &VidraResource) -> bool {
    context.config.event_based_reconcile
        || instance.spec.reconcile_on_events
        || instance.spec.destination.reconcile_on_events
}

/// Implements the generation predicate plus the periodic requeue, exactly
/// like the sync controller's guard.
fn requeue_in(instance: &VidraResource, interval: Duration) -> Option<Duration> {
    let status = instance.status.as_ref()?;
    if status.observed_generation != instance.metadata.generation {
        return None;
    }
    if status.deploy_state != State::Succeeded {
        return None;
    }
    let age = util::age_of(status.last_sync_time.as_deref())?;
    interval.checked_sub(age)
}

// Finalizer helpers
fn has_finalizer(instance: &VidraResource) -> bool {
    instance.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer(client: &Client, name: &str) -> Result<(), Error> {
    let api: Api<VidraResource> = Api::all(client.clone());
    util::retry_on_conflict(|| {
        let api = api.clone();
        let name = name.to_string();
        async move {
            let Some(mut current) = api.get_opt(&name).await? else {
                return Ok(());
            };
            if current.finalizers().iter().any(|f| f == FINALIZER) {
                return Ok(());
            }
            current
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER.to_string());
            api.replace(&name, &PostParams::default(), &current)
                .await
                .map(|_| ())
        }
    })
    .await?;
    Ok(())
}

async fn remove_finalizer(client: &Client, name: &str) -> Result<(), Error> {
    let api: Api<VidraResource> = Api::all(client.clone());
    util::retry_on_conflict(|| {
        let api = api.clone();
        let name = name.to_string();
        async move {
            let Some(mut current) = api.get_opt(&name).await? else {
                return Ok(());
            };
            if let Some(finalizers) = current.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != FINALIZER);
            }
            api.replace(&name, &PostParams::default(), &current)
                .await
                .map(|_| ())
        }
    })
    .await?;
    Ok(())
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
fn on_error(instance: Arc<VidraResource>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Apply reconciliation error on {}: {}",
            instance.name_any(),
            error
        )
        .red()
    );
    Action::requeue(util::ERROR_REQUEUE)
}
