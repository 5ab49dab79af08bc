use kube::client::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::util::{Error, config::OperatorConfig};
use crate::{infrahub, multicluster::ClientCache, resources, syncs, watches};

/// Runs both controllers for as long as this replica holds the leader
/// lease. On leadership loss the controller tasks are aborted and the
/// replica goes back to standby.
pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Vidra operator...".green());

    let config = OperatorConfig::load(client.clone()).await?;
    println!(
        "requeue intervals: sync {:?}, resources {:?} (event based: {})",
        config.requeue_sync_after, config.requeue_resource_after, config.event_based_reconcile
    );

    // Watch events are funneled through a single trigger task that bumps
    // the owning child, so watcher streams never talk to the API server
    // themselves.
    let (fabric, trigger_rx) = watches::WatchFabric::new();
    let fabric = Arc::new(fabric);
    tokio::spawn(watches::run_owner_trigger(client.clone(), trigger_rx));

    let sync_context = Arc::new(syncs::ContextData::new(
        client.clone(),
        infrahub::Client::new()?,
        config.clone(),
    ));
    let resource_context = Arc::new(resources::ContextData::new(
        client.clone(),
        ClientCache::new(),
        fabric,
        config.clone(),
    ));

    // Namespace where the Lease object lives.
    // Commonly: the controller's namespace. If you deploy in one namespace, hardcode it.
    // If you want it dynamic, inject NAMESPACE via the Downward API.
    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("vidra-operator-{}", uuid::Uuid::new_v4()));
    // The shared lock name across all replicas
    let lease_name = "vidra-operator-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        vidra_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    vidra_common::signal_ready();
    println!("{}", "🌱 Vidra operator on standby.".green());
    // We run indefinitely; only the leader runs the controllers.
    // On leadership loss, we abort the controllers and go back to standby.
    let mut controller_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                for task in controller_tasks.drain(..) {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if !controller_tasks.is_empty() {
                    for task in controller_tasks.drain(..) {
                        task.abort();
                    }
                    eprintln!("aborted controllers due to leader election error");
                }
                continue;
            }
        };
        if lease.acquired_lease {
            // We are leader; ensure the controllers are running
            if controller_tasks.is_empty() {
                println!("{}", "👑 Acquired leadership; starting controllers".green());
                controller_tasks.push(tokio::spawn(syncs::run(sync_context.clone())));
                controller_tasks.push(tokio::spawn(resources::run(resource_context.clone())));
            }
        } else if !controller_tasks.is_empty() {
            // We are NOT leader; ensure the controllers are stopped
            eprintln!("lost leadership; stopping controllers");
            for task in controller_tasks.drain(..) {
                task.abort();
            }
        }
    }
}
