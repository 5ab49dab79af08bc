use futures::stream::StreamExt;
use kube::{
    Api, Resource, ResourceExt,
    api::{DeleteParams, PostParams},
    client::Client,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::{collections::HashSet, sync::Arc};
use tokio::time::Duration;
use vidra_types::*;

use super::actions;
use crate::infrahub::{self, Artifact};
use crate::util::{
    self, Error, FINALIZER,
    colors::{FG1, FG2},
    config::OperatorConfig,
    secrets,
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `InfrahubSync` controller. Leadership and shutdown
/// are handled by the caller; this runs until the task is aborted.
pub async fn run(context: Arc<ContextData>) {
    let client = context.client.clone();
    println!("{}", "🚀 InfrahubSync controller started.".green());
    Controller::new(Api::<InfrahubSync>::all(client.clone()), Default::default())
        .owns(Api::<VidraResource>::all(client), Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
}

/// Context injected with each `reconcile` and `on_error` method invocation.
pub struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with.
    client: Client,

    /// Gateway to the Infrahub artifact catalog.
    infrahub: infrahub::Client,

    config: OperatorConfig,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    pub fn new(client: Client, infrahub: infrahub::Client, config: OperatorConfig) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                infrahub,
                config,
                metrics: ControllerMetrics::new("sync"),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                infrahub,
                config,
            }
        }
    }
}

/// Reconciliation function for the `InfrahubSync` resource.
async fn reconcile(instance: Arc<InfrahubSync>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name])
        .inc();

    // The spec is unchanged and the interval has not elapsed: this wake-up
    // came from our own status write or a child event. Just reschedule.
    if let Some(remaining) = requeue_in(&instance, context.config.requeue_sync_after) {
        return Ok(Action::requeue(remaining));
    }

    println!(
        "🔄 {}{}",
        name.color(FG2),
        " syncing artifacts from Infrahub".color(FG1)
    );
    actions::running(client.clone(), &instance).await?;

    #[cfg(feature = "metrics")]
    let timer = context
        .metrics
        .write_histogram
        .with_label_values(&[&name, "sync"])
        .start_timer();

    let result = sync_artifacts(&context, &instance).await;

    #[cfg(feature = "metrics")]
    timer.observe_duration();

    match result {
        Ok(checksums) => {
            #[cfg(feature = "metrics")]
            context
                .metrics
                .action_counter
                .with_label_values(&[&name, "Succeeded"])
                .inc();
            actions::succeeded(client, &instance, checksums).await?;
            Ok(Action::requeue(context.config.requeue_sync_after))
        }
        Err(err) => {
            #[cfg(feature = "metrics")]
            context
                .metrics
                .action_counter
                .with_label_values(&[&name, "Failed"])
                .inc();
            if let Err(patch_err) = actions::failed(client, &instance, &err).await {
                eprintln!("failed to record sync error on {name}: {patch_err}");
            }
            Err(err)
        }
    }
}

/// One pass against Infrahub: resolve credentials, enumerate artifacts,
/// and project them onto child resources. Returns the checksums of the
/// artifacts seen in this pass.
async fn sync_artifacts(
    context: &ContextData,
    instance: &InfrahubSync,
) -> Result<Vec<String>, Error> {
    let source = &instance.spec.source;

    let (username, password) =
        secrets::credentials_for(context.client.clone(), &source.infrahub_api_url).await?;
    let token = context
        .infrahub
        .login(&source.infrahub_api_url, &username, &password)
        .await?;
    let artifacts = context
        .infrahub
        .run_query(
            &context.config.query_name,
            &source.infrahub_api_url,
            &source.artifact_name,
            &source.target_branch,
            &source.target_date,
            &token,
        )
        .await?;

    process_artifacts(context, instance, &artifacts, &token).await?;

    Ok(artifacts.iter().map(|a| a.checksum.clone()).collect())
}

/// Reconciles the set of children against the current artifact set:
/// children whose artifact vanished are deleted, every current artifact
/// gets a child carrying its manifest.
async fn process_artifacts(
    context: &ContextData,
    instance: &InfrahubSync,
    artifacts: &[Artifact],
    token: &str,
) -> Result<(), Error> {
    let api: Api<VidraResource> = Api::all(context.client.clone());
    let current_ids: HashSet<&str> = artifacts.iter().map(|a| a.id.as_str()).collect();

    let children = api.list(&Default::default()).await?;
    for child in &children.items {
        if is_stale_child(child, &instance.spec.source, &current_ids) {
            let name = child.name_any();
            util::retry_on_conflict(|| {
                let api = api.clone();
                let name = name.clone();
                async move { api.delete(&name, &DeleteParams::default()).await.map(|_| ()) }
            })
            .await?;
            println!(
                "🗑 {}{}",
                name.color(FG2),
                " deleted child, artifact vanished upstream".color(FG1)
            );
        }
    }

    for artifact in artifacts {
        println!(
            "↪ artifact {} (storage {}, checksum {})",
            artifact.id, artifact.storage_id, artifact.checksum
        );
        upsert_child(context, &api, instance, artifact, token).await?;
    }

    Ok(())
}

/// Creates or updates the child for one artifact. The manifest is only
/// downloaded when the upstream checksum differs from the one the child
/// already carries.
async fn upsert_child(
    context: &ContextData,
    api: &Api<VidraResource>,
    instance: &InfrahubSync,
    artifact: &Artifact,
    token: &str,
) -> Result<(), Error> {
    let source = &instance.spec.source;

    let existing = api.get_opt(&artifact.id).await?;
    let manifest = match existing.as_ref() {
        Some(child) if child.spec.checksum == artifact.checksum => child.spec.manifest.clone(),
        _ => {
            context
                .infrahub
                .download_artifact(
                    &source.infrahub_api_url,
                    &artifact.id,
                    &source.target_branch,
                    &source.target_date,
                    token,
                )
                .await?
        }
    };

    let desired_spec = child_spec(instance, artifact, manifest);
    let fresh = new_child(instance, artifact, desired_spec.clone());
    util::retry_on_conflict(|| {
        let api = api.clone();
        let id = artifact.id.clone();
        let desired_spec = desired_spec.clone();
        let fresh = fresh.clone();
        async move {
            match api.get_opt(&id).await? {
                None => api.create(&PostParams::default(), &fresh).await.map(|_| ()),
                Some(mut child) => {
                    let mut desired = desired_spec;
                    // The bump field belongs to the watch fabric; never
                    // roll it back from here.
                    desired.reconciled_at = child.spec.reconciled_at.clone();
                    if child.spec == desired {
                        return Ok(());
                    }
                    child.spec = desired;
                    api.replace(&id, &PostParams::default(), &child)
                        .await
                        .map(|_| ())
                }
            }
        }
    })
    .await?;

    Ok(())
}

fn child_spec(instance: &InfrahubSync, artifact: &Artifact, manifest: String) -> VidraResourceSpec {
    VidraResourceSpec {
        source: instance.spec.source.clone(),
        destination: instance.spec.destination.clone(),
        checksum: artifact.checksum.clone(),
        manifest,
        reconcile_on_events: instance.spec.destination.reconcile_on_events,
        reconciled_at: None,
    }
}

/// A fresh child is named by its artifact id, carries the cleanup
/// finalizer up front, and is owned by the sync so Kubernetes garbage
/// collection cascades when the sync goes away.
fn new_child(instance: &InfrahubSync, artifact: &Artifact, spec: VidraResourceSpec) -> VidraResource {
    let mut child = VidraResource::new(&artifact.id, spec);
    child.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    child.metadata.owner_references = instance.controller_owner_ref(&()).map(|r| vec![r]);
    child
}

/// A child is stale when it was projected from the same source but its
/// artifact id is no longer returned by the query.
fn is_stale_child(
    child: &VidraResource,
    source: &InfrahubSource,
    current_ids: &HashSet<&str>,
) -> bool {
    child.spec.source == *source && !current_ids.contains(child.name_any().as_str())
}

/// Implements the generation predicate plus the periodic requeue: work is
/// due when the spec changed, the last pass did not succeed, or the sync
/// interval elapsed. Otherwise returns the time left until the next pass.
fn requeue_in(instance: &InfrahubSync, interval: Duration) -> Option<Duration> {
    let status = instance.status.as_ref()?;
    if status.observed_generation != instance.metadata.generation {
        return None;
    }
    if status.sync_state != State::Succeeded {
        return None;
    }
    let age = util::age_of(status.last_sync_time.as_deref())?;
    interval.checked_sub(age)
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
fn on_error(instance: Arc<InfrahubSync>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Sync reconciliation error on {}: {}", instance.name_any(), error).red()
    );
    Action::requeue(util::ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync(name: &str) -> InfrahubSync {
        let mut sync = InfrahubSync::new(
            name,
            InfrahubSyncSpec {
                source: InfrahubSource {
                    infrahub_api_url: "https://infrahub.example.com".into(),
                    target_branch: "main".into(),
                    target_date: String::new(),
                    artifact_name: "cluster-manifests".into(),
                },
                destination: Destination {
                    server: String::new(),
                    namespace: "default".into(),
                    reconcile_on_events: true,
                },
            },
        );
        sync.metadata.uid = Some("uid-1".into());
        sync
    }

    fn artifact() -> Artifact {
        Artifact {
            id: "a1".into(),
            storage_id: "s1".into(),
            checksum: "c1".into(),
        }
    }

    #[test]
    fn new_children_carry_finalizer_owner_and_manifest() {
        let root = sync("root");
        let spec = child_spec(&root, &artifact(), "kind: ConfigMap".into());
        let child = new_child(&root, &artifact(), spec);
        assert_eq!(child.name_any(), "a1");
        assert_eq!(
            child.metadata.finalizers.as_deref(),
            Some(&[FINALIZER.to_string()][..])
        );
        let owner = &child.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.name, "root");
        assert_eq!(owner.kind, "InfrahubSync");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(child.spec.checksum, "c1");
        assert_eq!(child.spec.manifest, "kind: ConfigMap");
        assert!(child.spec.reconcile_on_events);
    }

    #[test]
    fn stale_detection_requires_matching_source() {
        let root = sync("root");
        let current: HashSet<&str> = ["a1"].into();

        let mut ours = new_child(&root, &artifact(), child_spec(&root, &artifact(), String::new()));
        assert!(!is_stale_child(&ours, &root.spec.source, &current));

        // Same source, artifact no longer listed.
        ours.metadata.name = Some("gone".into());
        assert!(is_stale_child(&ours, &root.spec.source, &current));

        // Different source is never ours to delete.
        let mut foreign = ours.clone();
        foreign.spec.source.target_branch = "develop".into();
        assert!(!is_stale_child(&foreign, &root.spec.source, &current));
    }

    #[test]
    fn requeue_guard_lets_changed_generations_through() {
        let mut root = sync("root");
        root.metadata.generation = Some(3);
        root.status = Some(InfrahubSyncStatus {
            sync_state: State::Succeeded,
            observed_generation: Some(2),
            last_sync_time: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        });
        assert!(requeue_in(&root, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn requeue_guard_reschedules_fresh_successes() {
        let mut root = sync("root");
        root.metadata.generation = Some(3);
        root.status = Some(InfrahubSyncStatus {
            sync_state: State::Succeeded,
            observed_generation: Some(3),
            last_sync_time: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        });
        let remaining = requeue_in(&root, Duration::from_secs(60)).unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn requeue_guard_runs_failed_and_overdue_resources() {
        let mut root = sync("root");
        root.metadata.generation = Some(3);
        root.status = Some(InfrahubSyncStatus {
            sync_state: State::Failed,
            observed_generation: Some(3),
            last_sync_time: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        });
        assert!(requeue_in(&root, Duration::from_secs(60)).is_none());

        root.status.as_mut().unwrap().sync_state = State::Succeeded;
        root.status.as_mut().unwrap().last_sync_time = Some("2020-01-01T00:00:00Z".into());
        assert!(requeue_in(&root, Duration::from_secs(60)).is_none());

        // No status at all means the resource was never reconciled.
        root.status = None;
        assert!(requeue_in(&root, Duration::from_secs(60)).is_none());
    }
}
