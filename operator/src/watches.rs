use futures::StreamExt;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{ApiResource, DynamicObject, Patch, PatchParams},
    runtime::{WatchStreamExt, watcher},
};
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use vidra_types::VidraResource;

use crate::util::{MANAGED_BY_KEY, MANAGER_NAME, OPERATOR_ID, age_of, now_rfc3339};

/// A change observed on a managed object by one of the GVR watchers.
pub struct WatchEvent {
    pub object: DynamicObject,
    pub resource: ApiResource,
}

/// Set of GVRs that already have a watcher, guarded for the test-and-set.
/// The set is never shrunk: once a kind has been applied by any child the
/// operator keeps watching it for the rest of the process lifetime.
#[derive(Default)]
struct StartedSet(Mutex<HashSet<String>>);

impl StartedSet {
    /// Returns true when the key was newly inserted.
    fn insert(&self, key: &str) -> bool {
        self.0.lock().unwrap().insert(key.to_string())
    }
}

/// Starts at most one label-scoped watcher per GVR and forwards add,
/// spec-change and delete events to the owner-trigger task.
pub struct WatchFabric {
    started: StartedSet,
    tx: UnboundedSender<WatchEvent>,
}

impl WatchFabric {
    pub fn new() -> (Self, UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = unbounded_channel();
        (
            WatchFabric {
                started: StartedSet::default(),
                tx,
            },
            rx,
        )
    }

    /// Idempotent: resources whose watcher is already running are skipped.
    pub fn start_watching(&self, client: &Client, resources: &[ApiResource]) {
        for resource in resources {
            if !self.started.insert(&gvr_key(resource)) {
                continue; // already watching
            }
            tokio::spawn(watch_gvr(
                client.clone(),
                resource.clone(),
                self.tx.clone(),
            ));
        }
    }
}

async fn watch_gvr(client: Client, resource: ApiResource, tx: UnboundedSender<WatchEvent>) {
    let api: Api<DynamicObject> = Api::all_with(client, &resource);
    let config = watcher::Config::default().labels(&format!("{MANAGED_BY_KEY}={OPERATOR_ID}"));
    println!("[WATCH] started watching {}", gvr_key(&resource));

    // Last seen generation per object, to suppress wake-ups for changes
    // that did not touch the spec.
    let mut seen: HashMap<String, i64> = HashMap::new();
    let mut stream = std::pin::pin!(watcher(api, config).default_backoff());
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Ok(watcher::Event::InitApply(object)) | Ok(watcher::Event::Apply(object)) => {
                if generation_changed(&mut seen, &object) {
                    let _ = tx.send(WatchEvent {
                        object,
                        resource: resource.clone(),
                    });
                }
            }
            Ok(watcher::Event::Delete(object)) => {
                seen.remove(&object_key(&object));
                let _ = tx.send(WatchEvent {
                    object,
                    resource: resource.clone(),
                });
            }
            Err(err) => {
                eprintln!("[WATCH] watcher for {} failed: {err}", gvr_key(&resource));
            }
        }
    }
}

/// First sighting of an object always counts; afterwards only a changed
/// `metadata.generation` does. Kinds without a generation never pass the
/// update filter, matching the spec-change predicate.
fn generation_changed(seen: &mut HashMap<String, i64>, object: &DynamicObject) -> bool {
    let generation = object.metadata.generation.unwrap_or_default();
    match seen.insert(object_key(object), generation) {
        None => true,
        Some(previous) => previous != generation,
    }
}

fn object_key(object: &DynamicObject) -> String {
    format!(
        "{}/{}",
        object.namespace().unwrap_or_default(),
        object.name_any()
    )
}

fn gvr_key(resource: &ApiResource) -> String {
    format!(
        "{}/{}/{}",
        resource.group, resource.version, resource.plural
    )
}

/// Consumes watch events and wakes the owning children by bumping their
/// `spec.reconciledAt` field, which the controller's generation predicate
/// picks up. A short debounce keeps event storms from re-queuing a child
/// that was just triggered.
pub async fn run_owner_trigger(client: Client, mut rx: UnboundedReceiver<WatchEvent>) {
    let api: Api<VidraResource> = Api::all(client);
    while let Some(event) = rx.recv().await {
        trigger_owners(&api, &event).await;
    }
}

async fn trigger_owners(api: &Api<VidraResource>, event: &WatchEvent) {
    let object = &event.object;
    println!(
        "[WATCH] change detected on {}/{} ({})",
        object.namespace().unwrap_or_default(),
        object.name_any(),
        event.resource.plural
    );
    for owner in object.owner_references() {
        if owner.kind != VidraResource::kind(&())
            || owner.api_version != VidraResource::api_version(&())
        {
            continue;
        }
        let child = match api.get_opt(&owner.name).await {
            Ok(Some(child)) => child,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("[WATCH] failed to get VidraResource {}: {err}", owner.name);
                continue;
            }
        };
        if !bump_due(child.spec.reconciled_at.as_deref()) {
            continue;
        }
        let patch = serde_json::json!({"spec": {"reconciledAt": now_rfc3339()}});
        match api
            .patch(&owner.name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => println!("[WATCH] triggered reconcile of VidraResource {}", owner.name),
            Err(err) => {
                eprintln!("[WATCH] failed to trigger VidraResource {}: {err}", owner.name);
            }
        }
    }
}

/// Debounce: a child bumped within the last two seconds is left alone.
fn bump_due(reconciled_at: Option<&str>) -> bool {
    match age_of(reconciled_at) {
        Some(age) => age > Duration::from_secs(2),
        None => true,
    }
}
